//! Optimizador del listado emitido.
//!
//! Una secuencia de reescrituras por patrón sobre el flujo de líneas,
//! aplicadas en orden fijo; las de redundancia se iteran hasta el punto
//! fijo. Cada pase preserva la anotación de línea de origen. Correr el
//! optimizador sobre su propia salida no produce cambios.

use std::collections::HashMap;

use log::debug;

use crate::{
    asm::{family_of, is_function_begin, split_label, Line},
    decl::{Flags, Options},
};

/// Aplica la secuencia completa de pases sobre el listado.
pub fn run(mut lines: Vec<Line>, options: &Options) -> Vec<Line> {
    if options.flags.contains(Flags::ENABLE_OPTIMIZATIONS) {
        let mut rounds = 0;
        loop {
            let mut changed = false;
            changed |= dedup_loads(&mut lines);
            changed |= dedup_stores(&mut lines);
            changed |= store_then_load(&mut lines);
            changed |= load_store_load(&mut lines);
            changed |= collapse_labels(&mut lines);
            changed |= elide_jump_to_next(&mut lines);

            rounds += 1;
            if !changed {
                break;
            }
        }

        debug!("peephole fixpoint after {} rounds", rounds);

        renumber_labels(&mut lines);
        while fold_labels(&mut lines) {}
    }

    if options
        .flags
        .contains(Flags::SUBSTITUTE_BOOL_FOR_GREATER_THAN_ZERO)
    {
        substitute_bool(&mut lines);
    }

    lines
}

/// `LDWR x` seguido de `LDWR x`: la segunda carga sobra.
fn dedup_loads(lines: &mut Vec<Line>) -> bool {
    remove_following(lines, |a, b| {
        b.label.is_none()
            && a.opcode() == "LDWR"
            && b.opcode() == "LDWR"
            && a.operands() == b.operands()
    })
}

/// `STWR x` seguido de `STWR x`: el segundo almacenamiento sobra.
fn dedup_stores(lines: &mut Vec<Line>) -> bool {
    remove_following(lines, |a, b| {
        b.label.is_none()
            && a.opcode() == "STWR"
            && b.opcode() == "STWR"
            && a.operands() == b.operands()
    })
}

/// `STWR x` seguido de `LDWR x`: W ya contiene `x`.
fn store_then_load(lines: &mut Vec<Line>) -> bool {
    remove_following(lines, |a, b| {
        b.label.is_none()
            && a.opcode() == "STWR"
            && b.opcode() == "LDWR"
            && a.operands() == b.operands()
    })
}

/// `LDWR x / STWR y / LDWR x`: la recarga final sobra.
fn load_store_load(lines: &mut Vec<Line>) -> bool {
    let mut changed = false;
    let mut index = 0;

    while index + 2 < lines.len() {
        let applies = lines[index].opcode() == "LDWR"
            && lines[index + 1].opcode() == "STWR"
            && lines[index + 2].opcode() == "LDWR"
            && lines[index + 1].label.is_none()
            && lines[index + 2].label.is_none()
            && lines[index].operands() == lines[index + 2].operands();

        if applies {
            lines.remove(index + 2);
            changed = true;
        } else {
            index += 1;
        }
    }

    changed
}

/// Dos etiquetas adyacentes sobre NOP se funden en la primera.
fn collapse_labels(lines: &mut Vec<Line>) -> bool {
    let mut changed = false;
    let mut index = 0;

    while index + 1 < lines.len() {
        let collapsible = match (&lines[index].label, &lines[index + 1].label) {
            (Some(first), Some(second)) => {
                lines[index].code == "NOP"
                    && lines[index + 1].code == "NOP"
                    && !is_function_begin(first)
                    && !is_function_begin(second)
            }
            _ => false,
        };

        if collapsible {
            let from = lines[index + 1].label.clone().unwrap();
            let to = lines[index].label.clone().unwrap();

            lines.remove(index + 1);
            retarget(lines, &from, &to);
            changed = true;
        } else {
            index += 1;
        }
    }

    changed
}

/// Reapunta todo salto cuyo objetivo sea `from` hacia `to`.
fn retarget(lines: &mut [Line], from: &str, to: &str) {
    for line in lines.iter_mut() {
        if line.jump_target() == Some(from) {
            line.set_jump_target(to);
        }
    }
}

/// `JMP L` inmediatamente antes de `L:` se elimina.
fn elide_jump_to_next(lines: &mut Vec<Line>) -> bool {
    let mut changed = false;
    let mut index = 0;

    while index + 1 < lines.len() {
        let elide = lines[index].label.is_none()
            && lines[index].opcode() == "JMP"
            && lines[index].jump_target().is_some()
            && lines[index + 1].label.as_deref() == lines[index].jump_target();

        if elide {
            lines.remove(index);
            changed = true;
        } else {
            index += 1;
        }
    }

    changed
}

/// Renumera las etiquetas por orden de aparición.
///
/// Cada familia de constructo se renumera por aparte, de modo que los
/// pares inicio/fin de un mismo constructo conservan el mismo número.
/// Las etiquetas de inicio de función no se tocan.
fn renumber_labels(lines: &mut [Line]) {
    let mut assigned: HashMap<(String, String), u32> = HashMap::new();
    let mut counters: HashMap<String, u32> = HashMap::new();
    let mut rename: HashMap<String, String> = HashMap::new();

    for line in lines.iter() {
        let mut names: Vec<&str> = Vec::new();
        if let Some(label) = &line.label {
            names.push(label);
        }
        if let Some(target) = line.jump_target() {
            names.push(target);
        }

        for name in names {
            if rename.contains_key(name) || is_function_begin(name) {
                continue;
            }

            if let Some((prefix, number)) = split_label(name) {
                let family = family_of(&prefix);
                let key = (family.clone(), number);

                let new = match assigned.get(&key) {
                    Some(new) => *new,
                    None => {
                        let counter = counters
                            .entry(family.clone())
                            .or_insert_with(|| family_start(&family));

                        let new = *counter;
                        *counter += 1;
                        assigned.insert(key, new);
                        new
                    }
                };

                rename.insert(name.to_string(), format!("{}{}", prefix, new));
            }
        }
    }

    for line in lines.iter_mut() {
        if let Some(label) = &line.label {
            if let Some(new) = rename.get(label) {
                line.label = Some(new.clone());
            }
        }

        let retargeted = line
            .jump_target()
            .and_then(|target| rename.get(target))
            .cloned();
        if let Some(new) = retargeted {
            line.set_jump_target(&new);
        }
    }
}

/// Primer número de cada familia, igual al del emisor.
fn family_start(family: &str) -> u32 {
    if family == "function" {
        0
    } else {
        1
    }
}

/// `L: NOP` seguido de una línea sin etiqueta se funde en `L: <línea>`.
fn fold_labels(lines: &mut Vec<Line>) -> bool {
    let mut changed = false;
    let mut index = 0;

    while index + 1 < lines.len() {
        let foldable = lines[index].label.is_some()
            && lines[index].code == "NOP"
            && lines[index + 1].label.is_none();

        if foldable {
            let label = lines[index].label.clone();
            lines[index + 1].label = label;
            lines.remove(index);
            changed = true;
        } else {
            index += 1;
        }
    }

    changed
}

/// `CMPGREATER NULL` + `JMPNCMP L` equivale a `JMPZ L` en palabras sin
/// signo.
fn substitute_bool(lines: &mut Vec<Line>) {
    let mut index = 0;

    while index + 1 < lines.len() {
        let applies = lines[index].code == "CMPGREATER NULL"
            && lines[index + 1].opcode() == "JMPNCMP"
            && lines[index + 1].label.is_none();

        if applies {
            let target = lines[index + 1]
                .jump_target()
                .map(|target| target.to_string());

            if let Some(target) = target {
                let label = lines[index].label.clone();
                let source = lines[index].line;

                lines[index] = Line {
                    label,
                    code: format!("JMPZ {}", target),
                    line: source,
                };
                lines.remove(index + 1);
            }
        }

        index += 1;
    }
}

/// Renumera toda etiqueta a su línea absoluta en el archivo final.
///
/// `first_file_line` es el número (desde 1) de la primera línea del
/// listado dentro del archivo completo, después del encabezado.
pub fn apply_numeric_labels(lines: &mut [Line], first_file_line: usize) {
    let mut map: HashMap<String, String> = HashMap::new();
    for (index, line) in lines.iter().enumerate() {
        if let Some(label) = &line.label {
            map.insert(label.clone(), (first_file_line + index).to_string());
        }
    }

    for line in lines.iter_mut() {
        if let Some(label) = &line.label {
            if let Some(number) = map.get(label) {
                line.label = Some(number.clone());
            }
        }

        let retargeted = line
            .jump_target()
            .and_then(|target| map.get(target))
            .cloned();
        if let Some(number) = retargeted {
            line.set_jump_target(&number);
        }
    }
}

/// Elimina la línea `b` cuando el predicado acepta el par `(a, b)`.
fn remove_following<F>(lines: &mut Vec<Line>, predicate: F) -> bool
where
    F: Fn(&Line, &Line) -> bool,
{
    let mut changed = false;
    let mut index = 0;

    while index + 1 < lines.len() {
        if predicate(&lines[index], &lines[index + 1]) {
            lines.remove(index + 1);
            changed = true;
        } else {
            index += 1;
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decl::Options;

    fn optimized(lines: Vec<Line>) -> Vec<Line> {
        run(lines, &Options::default())
    }

    #[test]
    fn removes_redundant_load_pairs() {
        let lines = vec![
            Line::new("LDWR x", 1),
            Line::new("LDWR x", 2),
            Line::new("STWR y", 3),
        ];

        let out = optimized(lines);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].code, "LDWR x");
        assert_eq!(out[1].code, "STWR y");
    }

    #[test]
    fn removes_store_then_load() {
        let lines = vec![
            Line::new("STWR x", 1),
            Line::new("LDWR x", 2),
            Line::new("ADDW y", 3),
        ];

        let out = optimized(lines);
        assert_eq!(out.iter().filter(|l| l.opcode() == "LDWR").count(), 0);
    }

    #[test]
    fn collapses_adjacent_labels_and_retargets() {
        let lines = vec![
            Line::labeled("end_if_label_1", "NOP", 1),
            Line::labeled("end_if_label_2", "NOP", 2),
            Line::new("JMP end_if_label_2", 3),
            Line::new("END", 4),
        ];

        let out = optimized(lines);
        assert!(out
            .iter()
            .all(|l| l.label.as_deref() != Some("end_if_label_2")));
        assert!(out
            .iter()
            .any(|l| l.jump_target() == Some("end_if_label_1")));
    }

    #[test]
    fn elides_jump_to_next_line() {
        let lines = vec![
            Line::new("JMP end_if_label_1", 1),
            Line::labeled("end_if_label_1", "END", 2),
        ];

        let out = optimized(lines);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].code, "END");
    }

    #[test]
    fn folds_label_nop_into_next_line() {
        let lines = vec![
            Line::labeled("begin_while_label_1", "NOP", 1),
            Line::new("LDWR k", 2),
        ];

        let out = optimized(lines);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label.as_deref(), Some("begin_while_label_1"));
        assert_eq!(out[0].code, "LDWR k");
    }

    #[test]
    fn renumbers_by_order_of_appearance() {
        let lines = vec![
            Line::labeled("begin_while_label_7", "LDWR k", 1),
            Line::new("JMPNCMP end_while_label_7", 1),
            Line::new("JMP begin_while_label_7", 2),
            Line::labeled("end_while_label_7", "END", 3),
        ];

        let out = optimized(lines);
        assert_eq!(out[0].label.as_deref(), Some("begin_while_label_1"));
        assert_eq!(out[1].jump_target(), Some("end_while_label_1"));
    }

    #[test]
    fn function_begin_labels_are_untouched() {
        let lines = vec![
            Line::new("JMPPUSH begin_function_f_label_0", 1),
            Line::new("END", 1),
            Line::labeled("begin_function_f_label_0", "NOP", 2),
            Line::new("JMPPOP", 3),
        ];

        let out = optimized(lines);
        assert!(out
            .iter()
            .any(|l| l.label.as_deref() == Some("begin_function_f_label_0")));
    }

    #[test]
    fn optimizer_is_idempotent() {
        let lines = vec![
            Line::labeled("begin_while_label_3", "NOP", 1),
            Line::new("LDWR k", 1),
            Line::new("CMPLESS inlinevar_for_10", 2),
            Line::new("JMPNCMP end_while_label_3", 2),
            Line::labeled("begin_body_while_label_3", "NOP", 2),
            Line::new("INC k", 3),
            Line::new("JMP begin_while_label_3", 3),
            Line::labeled("end_while_label_3", "NOP", 3),
            Line::new("END", 3),
        ];

        let once = optimized(lines);
        let twice = optimized(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn bool_substitution_rewrites_truthiness_tests() {
        let lines = vec![
            Line::new("LDWR x", 1),
            Line::new("CMPGREATER NULL", 1),
            Line::new("JMPNCMP end_if_label_1", 1),
            Line::labeled("end_if_label_1", "END", 2),
        ];

        let mut options = Options::default();
        options.flags |= Flags::SUBSTITUTE_BOOL_FOR_GREATER_THAN_ZERO;

        let out = run(lines, &options);
        assert!(out.iter().any(|l| l.code == "JMPZ end_if_label_1"));
        assert!(out.iter().all(|l| l.opcode() != "CMPGREATER"));
    }

    #[test]
    fn numeric_labels_use_absolute_file_lines() {
        let mut lines = vec![
            Line::labeled("begin_while_label_1", "LDWR k", 1),
            Line::new("JMP begin_while_label_1", 2),
        ];

        // Encabezado de 4 líneas: el cuerpo comienza en la línea 5
        apply_numeric_labels(&mut lines, 5);
        assert_eq!(lines[0].label.as_deref(), Some("5"));
        assert_eq!(lines[1].jump_target(), Some("5"));
    }
}
