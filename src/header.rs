//! Escritura del encabezado de declaraciones.

use crate::symbol::{SymbolTable, Variable};

/// Emite el bloque de encabezado: una línea `const` o `var` por cada
/// símbolo declarado o internado, en orden de declaración. Las
/// variables sintetizadas por el emisor van al final, tras un
/// comentario que marca la frontera.
pub fn write(symbols: &SymbolTable) -> Vec<String> {
    let mut lines = Vec::new();

    for constant in symbols.constants() {
        lines.push(format!(
            "const {} {}",
            constant.name,
            format_value(constant.value),
        ));
    }

    for var in symbols.variables().filter(|var| !var.interned) {
        lines.push(var_line(var));
    }

    let interned: Vec<&Variable> = symbols.variables().filter(|var| var.interned).collect();
    if !interned.is_empty() {
        lines.push(String::from("# inline variables"));
        for var in interned {
            lines.push(var_line(var));
        }
    }

    lines
}

/// Una línea `var`, con los campos finales recortados por la derecha.
fn var_line(var: &Variable) -> String {
    let mut fields = vec![
        var.kind.to_string(),
        var.unit.clone().unwrap_or_default(),
        var.encoding.clone().unwrap_or_default(),
    ];

    while fields.last().map(String::is_empty).unwrap_or(false) {
        fields.pop();
    }

    let mut line = format!("var {} {}", var.name, var.value);
    if !fields.is_empty() {
        line.push_str(", ");
        line.push_str(&fields.join(", "));
    }

    line
}

/// Las constantes grandes se escriben en hexadecimal.
fn format_value(value: u64) -> String {
    if value >= 1 << 32 {
        format!("0x{:x}", value)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::VarKind;

    #[test]
    fn header_carries_kind_and_unit_fields() {
        let mut symbols = SymbolTable::new();
        symbols
            .add_var("t", VarKind::Parameter, 20_000, None, Some("us".into()), 1)
            .unwrap();
        symbols
            .add_var("k", VarKind::Plain, 0, None, None, 2)
            .unwrap();

        let header = write(&symbols);
        assert!(header.contains(&String::from("var t 20000, parameter, us")));
        assert!(header.contains(&String::from("var k 0")));
    }

    #[test]
    fn firmware_constants_render_in_hex_when_wide() {
        let symbols = SymbolTable::new();
        let header = write(&symbols);

        assert!(header.contains(&String::from("const NULL 0")));
        assert!(header.contains(&String::from("const FFFFFFFF 0xffffffffffffffff")));
        assert!(header.contains(&String::from("const INTERRUPT_EXITCODE 0xfffe100000000000")));
    }

    #[test]
    fn interned_literals_follow_the_marker() {
        let mut symbols = SymbolTable::new();
        symbols
            .add_var("k", VarKind::Plain, 0, None, None, 1)
            .unwrap();
        symbols.intern_inline(10);

        let header = write(&symbols);
        let marker = header
            .iter()
            .position(|line| line == "# inline variables")
            .unwrap();
        let interned = header
            .iter()
            .position(|line| line == "var inlinevar_for_10 10")
            .unwrap();
        let user = header.iter().position(|line| line == "var k 0").unwrap();

        assert!(user < marker);
        assert!(marker < interned);
    }

    #[test]
    fn encoding_without_unit_keeps_its_column() {
        let mut symbols = SymbolTable::new();
        symbols
            .add_var("f", VarKind::Parameter, 7, Some("Hz10".into()), None, 1)
            .unwrap();

        let header = write(&symbols);
        assert!(header.contains(&String::from("var f 7, parameter, , Hz10")));
    }
}
