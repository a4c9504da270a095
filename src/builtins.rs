//! Catálogo de primitivas integradas.
//!
//! Cada primitiva es una función pura de la tabla de símbolos y de los
//! argumentos del sitio de llamada. La mayoría produce una secuencia
//! corta de líneas de ensamblador; las primitivas de consulta
//! (`pipe_empty`, `ram_read_valid`) producen en cambio un par de
//! opcodes de salto que el emisor de condiciones usa directamente.

use crate::{
    asm::Line,
    error::{Compile, CompileError},
    symbol::{Symbol, SymbolTable, VarKind},
};

/// Nombres de todas las primitivas, para poblar la tabla de símbolos.
pub const NAMES: &[&str] = &[
    "set_shutter",
    "set_inv_shutter",
    "set_counter",
    "clear_counter",
    "update",
    "set_trigger",
    "set_dds",
    "load_count",
    "read_pipe",
    "write_pipe",
    "write_result",
    "pipe_empty",
    "ram_read_valid",
    "read_ram",
    "set_ram_address",
    "wait_dds",
    "wait_trigger",
    "set_sync_time",
    "wait_sync",
    "exit",
    "serial_write",
    "set_parameter",
    "set_dac",
    "pulse",
    "rand",
    "rand_seed",
    "apply_next_scan_point",
    "nop",
];

/// Primitivas cuyo resultado es un par de saltos de consulta.
pub const QUERIES: &[&str] = &["pipe_empty", "ram_read_valid"];

/// Argumento de primitiva ya resuelto por el emisor.
#[derive(Debug, Clone)]
pub enum Arg {
    /// Nombre de símbolo, ya desambiguado por espacios de nombres.
    Name(String),
    /// Literal entero aún sin internar.
    Literal(u64),
}

/// Resultado de expandir una primitiva.
#[derive(Debug)]
pub enum Effect {
    /// Secuencia de instrucciones a insertar en el sitio de llamada.
    Lines(Vec<Line>),

    /// Par de opcodes de salto para posiciones de prueba: el primero
    /// se toma cuando la consulta es verdadera, el segundo cuando no.
    Query {
        on_true: &'static str,
        on_false: &'static str,
    },
}

pub fn is_builtin(name: &str) -> bool {
    NAMES.contains(&name)
}

/// Expande una primitiva en su efecto.
pub fn emit(
    name: &str,
    symbols: &mut SymbolTable,
    args: &[Arg],
    kwargs: &[(String, Arg)],
    line: u32,
) -> Compile<Effect> {
    let call = CallArgs {
        builtin: name,
        args,
        kwargs,
        line,
    };

    let lines = match name {
        "set_shutter" => {
            call.arity(1, 0)?;
            shutter_lines(symbols, call.positional(0)?, false, line)?
        }

        "set_inv_shutter" => {
            call.arity(1, 0)?;
            shutter_lines(symbols, call.positional(0)?, true, line)?
        }

        "set_counter" => {
            call.arity(1, 1)?;
            call.allow_keywords(&["sendmask"])?;

            let counter = var_operand(symbols, call.positional(0)?, Some(&[VarKind::Counter]), line)?;
            let mut lines = vec![Line::new(format!("COUNTERMASK {}", counter), line)];

            if let Some(mask) = call.keyword("sendmask") {
                let mask = var_operand(symbols, mask, None, line)?;
                lines.push(Line::new(format!("SENDENABLEMASK {}", mask), line));
            }

            lines
        }

        "clear_counter" => {
            call.arity(0, 0)?;
            vec![Line::new("COUNTERMASK NULL", line)]
        }

        "update" => {
            call.at_most(1)?;
            call.allow_keywords(&["wait_dds", "pulse_mode"])?;

            let wait_dds = call.flag("wait_dds", true)?;
            let pulse_mode = call.flag("pulse_mode", false)?;
            update_lines(symbols, call.args.first(), wait_dds, pulse_mode, line)?
        }

        "set_trigger" => {
            call.arity(1, 0)?;
            let trigger = var_operand(symbols, call.positional(0)?, Some(&[VarKind::Trigger]), line)?;
            vec![Line::new(format!("TRIGGER {}", trigger), line)]
        }

        "set_dds" => {
            call.at_most(1)?;
            call.allow_keywords(&["channel", "freq", "phase", "amp"])?;

            let channel = match (call.args.first(), call.keyword("channel")) {
                (Some(arg), _) | (None, Some(arg)) => const_operand(symbols, arg, line)?,
                (None, None) => return call.misuse("missing `channel` argument"),
            };

            let mut lines = Vec::new();
            for (keyword, opcode) in [("freq", "DDSFRQ"), ("phase", "DDSPHS"), ("amp", "DDSAMP")] {
                if let Some(arg) = call.keyword(keyword) {
                    let operand = operand(symbols, arg, line)?;
                    lines.push(Line::new(format!("{} {}, {}", opcode, channel, operand), line));
                }
            }

            lines
        }

        "load_count" => {
            call.arity(1, 0)?;
            let channel = const_operand(symbols, call.positional(0)?, line)?;
            vec![
                Line::new("NOP", line),
                Line::new(format!("LDCOUNT {}", channel), line),
            ]
        }

        "read_pipe" => {
            call.arity(0, 0)?;
            vec![Line::new("READPIPE", line)]
        }

        "write_pipe" => {
            call.at_most(1)?;
            let mut lines = Vec::new();
            if let Some(arg) = call.args.first() {
                let operand = operand(symbols, arg, line)?;
                lines.push(Line::new(format!("LDWR {}", operand), line));
            }
            lines.push(Line::new("WRITEPIPE", line));
            lines
        }

        "write_result" => {
            call.arity(2, 0)?;
            let channel = const_operand(symbols, call.positional(0)?, line)?;
            let value = var_operand(symbols, call.positional(1)?, None, line)?;
            vec![Line::new(
                format!("WRITERESULTTOPIPE {}, {}", channel, value),
                line,
            )]
        }

        "pipe_empty" => {
            call.arity(0, 0)?;
            return Ok(Effect::Query {
                on_true: "JMPPIPEEMPTY",
                on_false: "JMPPIPEAVAIL",
            });
        }

        "ram_read_valid" => {
            call.arity(0, 0)?;
            return Ok(Effect::Query {
                on_true: "JMPRAMVALID",
                on_false: "JMPRAMINVALID",
            });
        }

        "read_ram" => {
            call.arity(0, 0)?;
            vec![Line::new("RAMREAD", line)]
        }

        "set_ram_address" => {
            call.arity(1, 0)?;
            let operand = operand(symbols, call.positional(0)?, line)?;
            vec![Line::new(format!("SETRAMADDR {}", operand), line)]
        }

        "wait_dds" => {
            call.arity(0, 0)?;
            vec![Line::new("WAITDDSWRITEDONE", line)]
        }

        "wait_trigger" => {
            call.arity(1, 0)?;
            let operand = operand(symbols, call.positional(0)?, line)?;
            vec![Line::new(format!("WAITFORTRIGGER {}", operand), line)]
        }

        "set_sync_time" => {
            call.arity(1, 0)?;
            let operand = operand(symbols, call.positional(0)?, line)?;
            vec![Line::new(format!("SETSYNCTIME {}", operand), line)]
        }

        "wait_sync" => {
            call.arity(0, 0)?;
            vec![Line::new("WAITFORSYNC", line)]
        }

        "exit" => {
            call.arity(1, 0)?;
            let code = var_operand(symbols, call.positional(0)?, Some(&[VarKind::Exitcode]), line)?;
            vec![
                Line::new(format!("LDWR {}", code), line),
                Line::new("WAIT", line),
                Line::new("WRITEPIPE", line),
                Line::new("END", line),
            ]
        }

        "serial_write" => {
            call.arity(2, 0)?;
            let channel = const_operand(symbols, call.positional(0)?, line)?;
            let value = var_operand(symbols, call.positional(1)?, None, line)?;
            vec![Line::new(format!("SERIALWRITE {}, {}", channel, value), line)]
        }

        "set_parameter" => {
            call.arity(2, 0)?;
            let channel = const_operand(symbols, call.positional(0)?, line)?;
            let value = var_operand(symbols, call.positional(1)?, None, line)?;
            vec![Line::new(format!("SETPARAMETER {}, {}", channel, value), line)]
        }

        "set_dac" => {
            call.arity(2, 0)?;
            let channel = const_operand(symbols, call.positional(0)?, line)?;
            let value = var_operand(symbols, call.positional(1)?, None, line)?;
            vec![Line::new(format!("DACOUT {}, {}", channel, value), line)]
        }

        "pulse" => {
            call.arity(0, 5)?;
            call.allow_keywords(&["shutter", "trigger", "counter", "duration", "end_shutter"])?;

            let shutter = call.keyword("shutter");
            let end_shutter = call.keyword("end_shutter");

            let mut lines = Vec::new();
            if let Some(arg) = shutter {
                lines.extend(shutter_lines(symbols, arg, false, line)?);
            }

            if let Some(arg) = call.keyword("trigger") {
                let trigger = var_operand(symbols, arg, Some(&[VarKind::Trigger]), line)?;
                lines.push(Line::new(format!("TRIGGER {}", trigger), line));
            }

            if let Some(arg) = call.keyword("counter") {
                let counter = var_operand(symbols, arg, Some(&[VarKind::Counter]), line)?;
                lines.push(Line::new(format!("COUNTERMASK {}", counter), line));
            }

            lines.extend(update_lines(
                symbols,
                call.keyword("duration"),
                true,
                end_shutter.is_none(),
                line,
            )?);

            lines.push(Line::new("COUNTERMASK NULL", line));

            if let Some(arg) = end_shutter {
                lines.extend(shutter_lines(symbols, arg, false, line)?);
            } else if let Some(arg) = shutter {
                lines.extend(shutter_lines(symbols, arg, true, line)?);
            }

            lines
        }

        "rand" => {
            call.arity(0, 0)?;
            vec![Line::new("RAND", line)]
        }

        "rand_seed" => {
            call.arity(1, 0)?;
            let operand = operand(symbols, call.positional(0)?, line)?;
            vec![Line::new(format!("RANDSEED {}", operand), line)]
        }

        "apply_next_scan_point" => {
            call.arity(0, 0)?;

            // Si hay una interrupción pendiente el programa termina con
            // el exitcode de interrupción; de lo contrario se drena el
            // pipe de puntos de barrido hacia el archivo de registros.
            let number = symbols.labels.next_or();
            let begin = format!("apply_scan_label_{}", number);
            let load = format!("load_scan_label_{}", number);

            vec![
                Line::labeled(begin, format!("JMPNINTERRUPT {}", load), line),
                Line::new("LDWR INTERRUPT_EXITCODE", line),
                Line::new("WRITEPIPE", line),
                Line::new("END", line),
                Line::labeled(load.clone(), "READPIPEINDF", line),
                Line::new(format!("JMPPIPEAVAIL {}", load), line),
            ]
        }

        "nop" => {
            call.arity(0, 0)?;
            vec![Line::new("NOP", line)]
        }

        other => {
            return Err(CompileError::Undeclared {
                line,
                name: other.to_string(),
            })
        }
    };

    Ok(Effect::Lines(lines))
}

/// Vista de los argumentos de un sitio de llamada.
struct CallArgs<'a> {
    builtin: &'a str,
    args: &'a [Arg],
    kwargs: &'a [(String, Arg)],
    line: u32,
}

impl CallArgs<'_> {
    fn positional(&self, index: usize) -> Compile<&Arg> {
        self.args.get(index).ok_or_else(|| CompileError::Syntax {
            line: self.line,
            what: format!("missing argument {} of `{}`", index + 1, self.builtin),
        })
    }

    fn keyword(&self, name: &str) -> Option<&Arg> {
        self.kwargs
            .iter()
            .find(|(keyword, _)| keyword == name)
            .map(|(_, arg)| arg)
    }

    fn arity(&self, positional: usize, keywords: usize) -> Compile<()> {
        if self.args.len() > positional || self.kwargs.len() > keywords {
            self.misuse("too many arguments")
        } else {
            Ok(())
        }
    }

    fn at_most(&self, positional: usize) -> Compile<()> {
        if self.args.len() > positional {
            self.misuse("too many arguments")
        } else {
            Ok(())
        }
    }

    fn allow_keywords(&self, allowed: &[&str]) -> Compile<()> {
        for (keyword, _) in self.kwargs {
            if !allowed.contains(&keyword.as_str()) {
                return self.misuse(&format!("unknown keyword argument `{}`", keyword));
            }
        }

        Ok(())
    }

    /// Bandera de compilación: debe ser un literal, no un operando.
    fn flag(&self, name: &str, default: bool) -> Compile<bool> {
        match self.keyword(name) {
            None => Ok(default),
            Some(Arg::Literal(value)) => Ok(*value != 0),
            Some(Arg::Name(_)) => self.misuse(&format!("`{}` must be a literal flag", name)),
        }
    }

    fn misuse<T>(&self, what: &str) -> Compile<T> {
        Err(CompileError::Syntax {
            line: self.line,
            what: format!("{} in call to `{}`", what, self.builtin),
        })
    }
}

/// Resuelve un argumento a un operando: símbolo existente o literal
/// internado.
fn operand(symbols: &mut SymbolTable, arg: &Arg, line: u32) -> Compile<String> {
    match arg {
        Arg::Literal(value) => Ok(symbols.intern_inline(*value)),
        Arg::Name(name) => match symbols.resolve(name) {
            Some(Symbol::Var(_)) | Some(Symbol::Const(_)) => Ok(name.clone()),
            Some(_) => Err(CompileError::TypeMismatch {
                line,
                name: name.clone(),
                expected: "variable",
            }),
            None => Err(CompileError::Undeclared {
                line,
                name: name.clone(),
            }),
        },
    }
}

/// Resuelve un argumento que debe ser una variable, con tipos opcionales.
fn var_operand(
    symbols: &SymbolTable,
    arg: &Arg,
    kinds: Option<&[VarKind]>,
    line: u32,
) -> Compile<String> {
    match arg {
        Arg::Name(name) => {
            symbols.get_var(name, kinds, line)?;
            Ok(name.clone())
        }

        Arg::Literal(value) => Err(CompileError::TypeMismatch {
            line,
            name: value.to_string(),
            expected: "variable",
        }),
    }
}

/// Resuelve un argumento que debe ser un canal constante.
fn const_operand(symbols: &mut SymbolTable, arg: &Arg, line: u32) -> Compile<String> {
    match arg {
        Arg::Name(name) => {
            symbols.get_const(name, line)?;
            Ok(name.clone())
        }

        Arg::Literal(value) => Ok(symbols.intern_inline(*value)),
    }
}

/// Secuencia de escritura de shutter, directa o invertida.
fn shutter_lines(
    symbols: &SymbolTable,
    arg: &Arg,
    inverted: bool,
    line: u32,
) -> Compile<Vec<Line>> {
    let name = var_operand(
        symbols,
        arg,
        Some(&[VarKind::Shutter, VarKind::MaskedShutter]),
        line,
    )?;

    let var = symbols.get_var(&name, None, line)?;
    let mask = match var.kind {
        VarKind::MaskedShutter => format!("{}_mask", name),
        _ => String::from("FFFFFFFF"),
    };

    let opcode = if inverted { "ASYNCINVSHUTTER" } else { "ASYNCSHUTTER" };

    Ok(vec![
        Line::new(format!("SHUTTERMASK {}", mask), line),
        Line::new(format!("{} {}", opcode, name), line),
    ])
}

/// Secuencia de `update`: espera de DDS opcional, barrera y UPDATE.
fn update_lines(
    symbols: &mut SymbolTable,
    duration: Option<&Arg>,
    wait_dds: bool,
    pulse_mode: bool,
    line: u32,
) -> Compile<Vec<Line>> {
    let mut lines = Vec::new();
    if wait_dds {
        lines.push(Line::new("WAITDDSWRITEDONE", line));
    }

    lines.push(Line::new("WAIT", line));

    let duration = match duration {
        Some(arg) => operand(symbols, arg, line)?,
        None => String::from("NULL"),
    };

    if pulse_mode {
        lines.push(Line::new(format!("UPDATE 1, {}", duration), line));
    } else {
        lines.push(Line::new(format!("UPDATE {}", duration), line));
    }

    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_shutter() -> SymbolTable {
        let mut symbols = SymbolTable::new();
        symbols
            .add_var("main", VarKind::Shutter, 0, None, None, 1)
            .unwrap();
        symbols
            .add_var("t", VarKind::Parameter, 20_000, None, Some("us".into()), 2)
            .unwrap();
        symbols
    }

    fn codes(effect: Effect) -> Vec<String> {
        match effect {
            Effect::Lines(lines) => lines.into_iter().map(|l| l.code).collect(),
            Effect::Query { .. } => panic!("expected lines"),
        }
    }

    #[test]
    fn pulse_composes_the_full_sequence() {
        let mut symbols = table_with_shutter();
        let kwargs = vec![
            (String::from("shutter"), Arg::Name("main".into())),
            (String::from("duration"), Arg::Name("t".into())),
        ];

        let lines = codes(emit("pulse", &mut symbols, &[], &kwargs, 3).unwrap());
        assert_eq!(
            lines,
            vec![
                "SHUTTERMASK FFFFFFFF",
                "ASYNCSHUTTER main",
                "WAITDDSWRITEDONE",
                "WAIT",
                "UPDATE 1, t",
                "COUNTERMASK NULL",
                "SHUTTERMASK FFFFFFFF",
                "ASYNCINVSHUTTER main",
            ],
        );
    }

    #[test]
    fn masked_shutter_uses_its_companion_mask() {
        let mut symbols = SymbolTable::new();
        symbols
            .add_var("gate_mask", VarKind::MaskedShutter, 0, None, None, 1)
            .unwrap();
        symbols
            .add_var("gate", VarKind::MaskedShutter, 0, None, None, 1)
            .unwrap();

        let lines = codes(
            emit("set_shutter", &mut symbols, &[Arg::Name("gate".into())], &[], 2).unwrap(),
        );
        assert_eq!(lines, vec!["SHUTTERMASK gate_mask", "ASYNCSHUTTER gate"]);
    }

    #[test]
    fn set_trigger_demands_a_trigger_variable() {
        let mut symbols = table_with_shutter();
        let result = emit("set_trigger", &mut symbols, &[Arg::Name("main".into())], &[], 4);

        assert!(matches!(
            result,
            Err(CompileError::TypeMismatch { line: 4, .. }),
        ));
    }

    #[test]
    fn queries_return_jump_pairs() {
        let mut symbols = SymbolTable::new();
        match emit("pipe_empty", &mut symbols, &[], &[], 1).unwrap() {
            Effect::Query { on_true, on_false } => {
                assert_eq!(on_true, "JMPPIPEEMPTY");
                assert_eq!(on_false, "JMPPIPEAVAIL");
            }
            other => panic!("unexpected effect: {:?}", other),
        }
    }

    #[test]
    fn exit_emits_the_termination_sequence() {
        let mut symbols = SymbolTable::new();
        symbols
            .add_var("ok", VarKind::Exitcode, 0, None, None, 1)
            .unwrap();

        let lines = codes(emit("exit", &mut symbols, &[Arg::Name("ok".into())], &[], 9).unwrap());
        assert_eq!(lines, vec!["LDWR ok", "WAIT", "WRITEPIPE", "END"]);
    }

    #[test]
    fn update_without_duration_uses_null() {
        let mut symbols = SymbolTable::new();
        let lines = codes(emit("update", &mut symbols, &[], &[], 5).unwrap());
        assert_eq!(lines, vec!["WAITDDSWRITEDONE", "WAIT", "UPDATE NULL"]);
    }

    #[test]
    fn scan_point_handoff_is_six_instructions() {
        let mut symbols = SymbolTable::new();
        let lines = match emit("apply_next_scan_point", &mut symbols, &[], &[], 6).unwrap() {
            Effect::Lines(lines) => lines,
            other => panic!("unexpected effect: {:?}", other),
        };

        assert_eq!(lines.len(), 6);
        assert_eq!(lines[3].code, "END");
        assert!(lines[0].code.starts_with("JMPNINTERRUPT"));
        assert!(lines[5].code.starts_with("JMPPIPEAVAIL"));
    }
}
