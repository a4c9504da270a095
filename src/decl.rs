//! Pre-procesado de declaraciones y pragmas.
//!
//! Antes del análisis léxico se recorren las líneas crudas del fuente
//! en busca de pragmas de compilación, declaraciones de constantes y
//! variables, y funciones de ensamblador literal. Los patrones se
//! reconocen al inicio de línea (se permite indentación) en el orden
//! de prioridad del lenguaje. Toda línea consumida se deja en blanco
//! en lugar de eliminarse, de modo que los números de línea del resto
//! del programa —y por lo tanto los comentarios `# PPP LINE` del
//! ensamblador emitido— siguen refiriendo al fuente original.

use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

use bitflags::bitflags;

use crate::{
    error::{Compile, CompileError},
    symbol::{AssemblyFunction, SymbolTable, VarKind},
};

bitflags! {
    /// Banderas de compilación controladas por pragmas.
    pub struct Flags: u32 {
        /// Sustituir parámetros nunca escritos por el nombre del
        /// argumento en los empalmes inline.
        const SAFE_PASS_BY_REFERENCE = 0x01;

        /// Delegar al compilador legado basado en gramática. Se acepta
        /// por compatibilidad pero solo existe la ruta de AST.
        const USE_STANDARD_PPP_COMPILER = 0x02;

        /// Reescribir `CMPGREATER NULL` + `JMPNCMP` como `JMPZ`.
        const SUBSTITUTE_BOOL_FOR_GREATER_THAN_ZERO = 0x04;

        /// Habilitar los pases de optimización del listado.
        const ENABLE_OPTIMIZATIONS = 0x08;

        /// Forzar el empalme inline de toda función.
        const INLINE_ALL_FUNCTIONS = 0x10;

        /// Renumerar las etiquetas a su línea absoluta en el archivo.
        const USE_NUMERIC_LABELS = 0x20;
    }
}

/// Opciones efectivas de una compilación.
#[derive(Debug, Clone)]
pub struct Options {
    pub flags: Flags,
    /// Columna donde comienza el comentario `# PPP LINE`.
    pub comment_column: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            flags: Flags::SAFE_PASS_BY_REFERENCE | Flags::ENABLE_OPTIMIZATIONS,
            comment_column: 45,
        }
    }
}

/// Fuente listo para el análisis léxico.
pub struct Prepared {
    /// Líneas del fuente con las declaraciones ya consumidas.
    pub lines: Vec<String>,
    /// Nombres declarados por el usuario, en orden de declaración.
    pub user_vars: Vec<String>,
}

lazy_static! {
    static ref PRAGMA: Regex =
        Regex::new(r"^\s*#COMPILER_FLAG\s+([A-Za-z_]+)\s*=\s*(\S+)\s*$").unwrap();
    static ref ASSEMBLY: Regex = Regex::new(r"^\s*@assembly\s*$").unwrap();
    static ref DEF: Regex =
        Regex::new(r"^(\s*)def\s+([A-Za-z_]\w*)\s*\(([^)]*)\)\s*:\s*$").unwrap();
    static ref CONST: Regex =
        Regex::new(r"^\s*const\s+([A-Za-z_]\w*)\s*=\s*(\S+)\s*$").unwrap();
    static ref EXITCODE: Regex =
        Regex::new(r"^\s*exitcode\s+([A-Za-z_]\w*)\s*=\s*(\S+)\s*$").unwrap();
    static ref ADDRESS: Regex =
        Regex::new(r"^\s*address\s+([A-Za-z_]\w*)(?:\s*=\s*(\S+))?\s*$").unwrap();
    static ref VAR: Regex =
        Regex::new(r"^(\s*)var\s+([A-Za-z_]\w*)(?:\s*=\s*(.+?))?\s*$").unwrap();
    static ref PARAMETER: Regex =
        Regex::new(r"^\s*parameter\s*(?:<\s*([^>]*?)\s*>)?\s+([A-Za-z_]\w*)(?:\s*=\s*(.+?))?\s*$")
            .unwrap();
    static ref MASKED_SHUTTER: Regex =
        Regex::new(r"^\s*masked_shutter\s+([A-Za-z_]\w*)(?:\s*=\s*(\S+))?\s*$").unwrap();
    static ref SHUTTER: Regex =
        Regex::new(r"^\s*shutter\s+([A-Za-z_]\w*)(?:\s*=\s*(\S+))?\s*$").unwrap();
    static ref TRIGGER: Regex =
        Regex::new(r"^\s*trigger\s+([A-Za-z_]\w*)(?:\s*=\s*(\S+))?\s*$").unwrap();
    static ref COUNTER: Regex =
        Regex::new(r"^\s*counter\s+([A-Za-z_]\w*)(?:\s*=\s*(\S+))?\s*$").unwrap();
    static ref MAGNITUDE: Regex =
        Regex::new(r"^([0-9][0-9a-fA-FxX\.]*)(?:\s+([A-Za-z]+))?$").unwrap();
}

/// Consume declaraciones y pragmas del fuente.
pub fn preprocess(
    source: &str,
    symbols: &mut SymbolTable,
    options: &mut Options,
) -> Compile<Prepared> {
    let mut lines: Vec<String> = source.lines().map(String::from).collect();
    let mut user_vars = Vec::new();

    let mut index = 0;
    while index < lines.len() {
        let line_no = index as u32 + 1;

        // Los pragmas tienen prioridad sobre los comentarios comunes
        if let Some(captures) = PRAGMA.captures(&lines[index]) {
            let name = captures[1].to_string();
            let value = captures[2].to_string();
            apply_pragma(options, &name, &value, line_no)?;

            lines[index].clear();
            index += 1;
            continue;
        }

        if lines[index].trim_start().starts_with('#') {
            index += 1;
            continue;
        }

        // El resto de patrones ignora un comentario al final de línea
        let head = match lines[index].find('#') {
            Some(cut) => lines[index][..cut].to_string(),
            None => lines[index].clone(),
        };

        if ASSEMBLY.is_match(&head) {
            index = assembly_block(&mut lines, index, symbols)?;
            continue;
        }

        if let Some(captures) = CONST.captures(&head) {
            let value = parse_int(&captures[2], line_no)?;
            symbols.add_const(&captures[1], value, line_no)?;
            lines[index].clear();
        } else if let Some(captures) = EXITCODE.captures(&head) {
            let value = parse_int(&captures[2], line_no)?;
            declare(symbols, &mut user_vars, &captures[1], VarKind::Exitcode, value, None, None, line_no)?;
            lines[index].clear();
        } else if let Some(captures) = ADDRESS.captures(&head) {
            let value = optional_int(captures.get(2).map(|m| m.as_str()), line_no)?;
            declare(symbols, &mut user_vars, &captures[1], VarKind::Address, value, None, None, line_no)?;
            lines[index].clear();
        } else if let Some(captures) = VAR.captures(&head) {
            let indent = captures[1].to_string();
            let name = captures[2].to_string();

            match captures.get(3).map(|m| m.as_str()) {
                None => {
                    declare(symbols, &mut user_vars, &name, VarKind::Plain, 0, None, None, line_no)?;
                    lines[index].clear();
                }

                Some(value) => match split_magnitude(value, line_no)? {
                    Some((value, unit)) => {
                        declare(symbols, &mut user_vars, &name, VarKind::Plain, value, None, unit, line_no)?;
                        lines[index].clear();
                    }

                    // El valor no es un literal: se declara en cero y
                    // la línea queda como una asignación ordinaria
                    None => {
                        declare(symbols, &mut user_vars, &name, VarKind::Plain, 0, None, None, line_no)?;
                        lines[index] = format!("{}{} = {}", indent, name, value);
                    }
                },
            }
        } else if let Some(captures) = PARAMETER.captures(&head) {
            let encoding = captures.get(1).map(|m| m.as_str().to_string());
            let name = captures[2].to_string();

            let (value, unit) = match captures.get(3).map(|m| m.as_str()) {
                None => (0, None),
                Some(value) => split_magnitude(value, line_no)?.ok_or_else(|| {
                    CompileError::Syntax {
                        line: line_no,
                        what: String::from("declaration value must be a literal"),
                    }
                })?,
            };

            declare(symbols, &mut user_vars, &name, VarKind::Parameter, value, encoding, unit, line_no)?;
            lines[index].clear();
        } else if let Some(captures) = MASKED_SHUTTER.captures(&head) {
            let name = captures[1].to_string();
            let value = optional_int(captures.get(2).map(|m| m.as_str()), line_no)?;

            // El compañero de máscara se declara primero
            declare(symbols, &mut user_vars, &format!("{}_mask", name), VarKind::MaskedShutter, 0, None, None, line_no)?;
            declare(symbols, &mut user_vars, &name, VarKind::MaskedShutter, value, None, None, line_no)?;
            lines[index].clear();
        } else if let Some(captures) = SHUTTER.captures(&head) {
            let value = optional_int(captures.get(2).map(|m| m.as_str()), line_no)?;
            declare(symbols, &mut user_vars, &captures[1], VarKind::Shutter, value, None, None, line_no)?;
            lines[index].clear();
        } else if let Some(captures) = TRIGGER.captures(&head) {
            let value = optional_int(captures.get(2).map(|m| m.as_str()), line_no)?;
            declare(symbols, &mut user_vars, &captures[1], VarKind::Trigger, value, None, None, line_no)?;
            lines[index].clear();
        } else if let Some(captures) = COUNTER.captures(&head) {
            let value = optional_int(captures.get(2).map(|m| m.as_str()), line_no)?;
            declare(symbols, &mut user_vars, &captures[1], VarKind::Counter, value, None, None, line_no)?;
            lines[index].clear();
        }

        index += 1;
    }

    Ok(Prepared { lines, user_vars })
}

/// Declara una variable de usuario y la registra en el listado.
#[allow(clippy::too_many_arguments)]
fn declare(
    symbols: &mut SymbolTable,
    user_vars: &mut Vec<String>,
    name: &str,
    kind: VarKind,
    value: u64,
    encoding: Option<String>,
    unit: Option<String>,
    line: u32,
) -> Compile<()> {
    symbols.add_var(name, kind, value, encoding, unit, line)?;
    user_vars.push(name.to_string());
    Ok(())
}

/// Captura una función de ensamblador literal y su bloque indentado.
fn assembly_block(
    lines: &mut [String],
    start: usize,
    symbols: &mut SymbolTable,
) -> Compile<usize> {
    let def_index = start + 1;
    let line_no = def_index as u32 + 1;

    let captures = lines
        .get(def_index)
        .and_then(|line| DEF.captures(line))
        .ok_or_else(|| CompileError::Syntax {
            line: start as u32 + 1,
            what: String::from("`@assembly` must be followed by a function definition"),
        })?;

    let def_indent = captures[1].len();
    let name = captures[2].to_string();
    let params: Vec<String> = captures[3]
        .split(',')
        .map(str::trim)
        .filter(|param| !param.is_empty())
        .map(String::from)
        .collect();

    let mut body = Vec::new();
    let mut index = def_index + 1;
    while index < lines.len() {
        let text = &lines[index];
        if text.trim().is_empty() {
            index += 1;
            continue;
        }

        let indent = text.len() - text.trim_start().len();
        if indent <= def_indent {
            break;
        }

        let instruction = match text.find('#') {
            Some(cut) => text[..cut].trim().to_string(),
            None => text.trim().to_string(),
        };

        if !instruction.is_empty() {
            body.push(instruction);
        }

        lines[index].clear();
        index += 1;
    }

    symbols.add_assembly(AssemblyFunction {
        name,
        params,
        body,
        line: line_no,
    })?;

    lines[start].clear();
    lines[def_index].clear();

    Ok(index)
}

/// Aplica un pragma `#COMPILER_FLAG NAME = VALUE`.
fn apply_pragma(options: &mut Options, name: &str, value: &str, line: u32) -> Compile<()> {
    let bad = || CompileError::BadPragma {
        line,
        name: name.to_string(),
        value: value.to_string(),
    };

    let flag = match name {
        "SAFE_PASS_BY_REFERENCE" => Some(Flags::SAFE_PASS_BY_REFERENCE),
        "USE_STANDARD_PPP_COMPILER" => Some(Flags::USE_STANDARD_PPP_COMPILER),
        "SUBSTITUTE_BOOL_FOR_GREATER_THAN_ZERO" => {
            Some(Flags::SUBSTITUTE_BOOL_FOR_GREATER_THAN_ZERO)
        }
        "ENABLE_OPTIMIZATIONS" => Some(Flags::ENABLE_OPTIMIZATIONS),
        "INLINE_ALL_FUNCTIONS" => Some(Flags::INLINE_ALL_FUNCTIONS),
        "USE_NUMERIC_LABELS" => Some(Flags::USE_NUMERIC_LABELS),
        "SOURCE_LINE_COMMENT_COLUMN" => None,
        _ => return Err(bad()),
    };

    match flag {
        Some(flag) => {
            let enable = match value {
                "0" => false,
                "1" => true,
                _ => return Err(bad()),
            };

            options.flags.set(flag, enable);

            if flag == Flags::USE_STANDARD_PPP_COMPILER && enable {
                warn!(
                    "line {}: USE_STANDARD_PPP_COMPILER requested, only the AST compiler exists",
                    line,
                );
            }
        }

        None => {
            options.comment_column = value.parse().map_err(|_| bad())?;
        }
    }

    Ok(())
}

/// Entero literal decimal o `0x` hexadecimal.
fn parse_int(text: &str, line: u32) -> Compile<u64> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        text.parse::<u64>()
    };

    parsed.map_err(|_| CompileError::Syntax {
        line,
        what: format!("bad integer literal `{}`", text),
    })
}

fn optional_int(text: Option<&str>, line: u32) -> Compile<u64> {
    match text {
        Some(text) => parse_int(text, line),
        None => Ok(0),
    }
}

/// Separa un valor declarado en magnitud y unidad opcional.
///
/// Retorna `None` si el texto no es un literal; el llamador decide si
/// eso es un error o una asignación a compilar normalmente.
fn split_magnitude(text: &str, line: u32) -> Compile<Option<(u64, Option<String>)>> {
    let captures = match MAGNITUDE.captures(text.trim()) {
        Some(captures) => captures,
        None => return Ok(None),
    };

    let magnitude = &captures[1];
    let unit = captures.get(2).map(|m| m.as_str());

    match unit {
        // Unidades de tiempo: la magnitud puede ser fraccional y se
        // reduce a ciclos de reloj
        Some(unit) => match SymbolTable::scale_magnitude(
            magnitude.parse::<f64>().map_err(|_| CompileError::Syntax {
                line,
                what: format!("bad magnitude `{}`", magnitude),
            })?,
            unit,
        ) {
            Some(cycles) => Ok(Some((cycles, Some(unit.to_string())))),

            // Unidad desconocida: viaja como etiqueta del encabezado
            None => Ok(Some((parse_int(magnitude, line)?, Some(unit.to_string())))),
        },

        None => Ok(Some((parse_int(magnitude, line)?, None))),
    }
}
