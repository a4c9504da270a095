//! Representación del programa ensamblador emitido.

use std::fmt::{self, Display};

/// Opcodes de salto; el último operando es siempre una etiqueta.
pub const JUMP_OPCODES: &[&str] = &[
    "JMP",
    "JMPZ",
    "JMPNZ",
    "JMPCMP",
    "JMPNCMP",
    "JMPPIPEEMPTY",
    "JMPPIPEAVAIL",
    "JMPRAMVALID",
    "JMPRAMINVALID",
    "JMPNINTERRUPT",
    "JMPPUSH",
];

/// Una línea de ensamblador emitida.
///
/// Lleva una etiqueta opcional, el texto del opcode con sus operandos
/// y la línea del fuente ppp de donde proviene. El render final añade
/// el comentario `# PPP LINE: n` en la columna configurada.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub label: Option<String>,
    pub code: String,
    pub line: u32,
}

impl Line {
    pub fn new(code: impl Into<String>, line: u32) -> Self {
        Line {
            label: None,
            code: code.into(),
            line,
        }
    }

    pub fn labeled(label: impl Into<String>, code: impl Into<String>, line: u32) -> Self {
        Line {
            label: Some(label.into()),
            code: code.into(),
            line,
        }
    }

    /// Primer token del texto: el opcode.
    pub fn opcode(&self) -> &str {
        self.code.split_whitespace().next().unwrap_or("")
    }

    /// Operandos tras el opcode, separados por comas o espacios.
    pub fn operands(&self) -> Vec<&str> {
        let rest = self.code.trim_start();
        let rest = match rest.find(char::is_whitespace) {
            Some(cut) => &rest[cut..],
            None => "",
        };

        rest.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .collect()
    }

    pub fn is_jump(&self) -> bool {
        JUMP_OPCODES.contains(&self.opcode())
    }

    /// Etiqueta objetivo de una instrucción de salto.
    pub fn jump_target(&self) -> Option<&str> {
        if self.is_jump() {
            self.operands().last().copied()
        } else {
            None
        }
    }

    /// Reescribe el objetivo de salto.
    pub fn set_jump_target(&mut self, target: &str) {
        if !self.is_jump() {
            return;
        }

        let opcode = self.opcode().to_string();
        let mut operands: Vec<String> =
            self.operands().iter().map(|s| s.to_string()).collect();

        if let Some(last) = operands.last_mut() {
            *last = target.to_string();
        }

        self.code = rebuild(&opcode, &operands);
    }

    /// Sustituye todo operando exactamente igual a `from` por `to`.
    pub fn replace_operand(&mut self, from: &str, to: &str) {
        let operands = self.operands();
        if !operands.contains(&from) {
            return;
        }

        let opcode = self.opcode().to_string();
        let operands: Vec<String> = operands
            .into_iter()
            .map(|operand| {
                if operand == from {
                    to.to_string()
                } else {
                    operand.to_string()
                }
            })
            .collect();

        self.code = rebuild(&opcode, &operands);
    }

    /// Forma textual final con el comentario de línea de origen.
    pub fn render(&self, column: usize) -> String {
        let body = match &self.label {
            Some(label) => format!("{}: {}", label, self.code),
            None => format!("  {}", self.code),
        };

        format!("{:<width$} # PPP LINE: {:>4}", body, self.line, width = column)
    }
}

impl Display for Line {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(fmt, "{}: {}", label, self.code),
            None => write!(fmt, "  {}", self.code),
        }
    }
}

/// Reconstruye el texto de una instrucción en forma canónica.
fn rebuild(opcode: &str, operands: &[String]) -> String {
    if operands.is_empty() {
        opcode.to_string()
    } else {
        format!("{} {}", opcode, operands.join(", "))
    }
}

/// Determina si una etiqueta es el inicio de una función no inline.
///
/// Estas etiquetas llevan el nombre de la función y el sufijo fijo
/// `_label_0`; nunca se renumeran ni se funden con otras.
pub fn is_function_begin(label: &str) -> bool {
    label.starts_with("begin_function_")
}

/// Descompone `prefijo_label_N` en prefijo (incluyendo `_label_`) y N.
pub fn split_label(name: &str) -> Option<(String, String)> {
    let position = name.rfind("_label_")?;
    let prefix = &name[..position + "_label_".len()];
    let number = &name[position + "_label_".len()..];

    if number.is_empty() || !number.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    Some((prefix.to_string(), number.to_string()))
}

/// Familia de numeración a la que pertenece un prefijo de etiqueta.
///
/// Los prefijos de un mismo constructo comparten número original, por
/// lo que deben renumerarse juntos.
pub fn family_of(prefix: &str) -> String {
    match prefix {
        "begin_if_label_" | "end_if_label_" => String::from("if"),
        "begin_while_label_" | "begin_body_while_label_" | "end_while_label_" => {
            String::from("while")
        }
        "else_label_" => String::from("else"),
        "or_label_" => String::from("or"),
        "end_function_label_" => String::from("function"),
        other => other.to_string(),
    }
}

/// Sitio de llamada sin resolver a una función de usuario.
///
/// El emisor inserta estos marcadores en lugar del código de la
/// llamada; un pase posterior los reemplaza por el cuerpo empalmado
/// (funciones inline) o por la secuencia de llamada y retorno.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub name: String,
    /// Operandos posicionales ya resueltos a nombres de símbolo.
    pub args: Vec<String>,
    /// Operandos de palabra clave ya resueltos a nombres de símbolo.
    pub kwargs: Vec<(String, String)>,
    pub line: u32,
    /// Cierto si el contexto exige que la función deje un valor en W.
    pub wants_value: bool,
}

/// Elemento del buffer de emisión: una línea o un sitio de llamada.
#[derive(Debug, Clone)]
pub enum Emitted {
    Op(Line),
    Call(CallSite),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_opcode_and_operands() {
        let line = Line::new("UPDATE 1, t", 3);
        assert_eq!(line.opcode(), "UPDATE");
        assert_eq!(line.operands(), vec!["1", "t"]);
    }

    #[test]
    fn recognizes_jump_targets() {
        let line = Line::new("JMPNCMP end_while_label_1", 2);
        assert_eq!(line.jump_target(), Some("end_while_label_1"));

        let mut line = line;
        line.set_jump_target("end_while_label_2");
        assert_eq!(line.code, "JMPNCMP end_while_label_2");
    }

    #[test]
    fn replaces_exact_operands_only() {
        let mut line = Line::new("WRITERESULTTOPIPE chan, f_x", 5);
        line.replace_operand("f_x", "value");
        assert_eq!(line.code, "WRITERESULTTOPIPE chan, value");

        let mut line = Line::new("LDWR f_xy", 5);
        line.replace_operand("f_x", "value");
        assert_eq!(line.code, "LDWR f_xy");
    }

    #[test]
    fn renders_label_and_comment_column() {
        let line = Line::labeled("begin_while_label_1", "NOP", 2);
        let rendered = line.render(45);
        assert!(rendered.starts_with("begin_while_label_1: NOP"));
        assert!(rendered.contains("# PPP LINE:    2"));
    }
}
