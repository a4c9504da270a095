//! Análisis léxico.
//!
//! # Tokenization
//! Esta fase descompone las líneas pre-procesadas (las declaraciones y
//! pragmas ya fueron consumidas y dejadas en blanco por [`crate::decl`])
//! en unidades léxicas. Los comentarios se descartan durante esta
//! operación. Cada token emitido está asociado a una ubicación en el
//! código fuente original.
//!
//! # Estructura de bloques
//! ppp delimita bloques por indentación al estilo de Python. El lexer
//! administra una pila de niveles de indentación y emite tokens
//! sintéticos [`Token::Indent`] y [`Token::Dedent`] en las fronteras,
//! además de [`Token::Newline`] al final de cada línea lógica. Las
//! líneas en blanco y las líneas de solo comentario no emiten nada.
//!
//! # Errores
//! Un error léxico detiene el escaneo de inmediato; no hay recuperación
//! parcial porque las fases siguientes no pueden avanzar con un flujo
//! incompleto.

use std::{
    fmt::{self, Display},
    str::FromStr,
};

use thiserror::Error;

use crate::source::{Located, Location, Position};

/// Error de escaneo.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LexerError {
    /// Carácter desconocido o inesperado en el flujo de entrada.
    #[error("Bad character {0:?} in input stream")]
    BadChar(char),

    /// Se esperaba un carácter específico en esta posición.
    #[error("Expected {0:?}")]
    Expected(char),

    /// Una constante entera se encuentra fuera de rango.
    #[error("Integer literal overflow, valid range is [0, {}]", u64::MAX)]
    IntOverflow,

    /// Tabulador en la indentación de una línea.
    #[error("Tab characters are not allowed in indentation")]
    TabIndent,

    /// La indentación no coincide con ningún nivel abierto.
    #[error("Unindent does not match any outer indentation level")]
    BadDedent,
}

/// Objeto resultante del análisis léxico.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Identificador.
    Id(String),

    /// Palabra clave.
    Keyword(Keyword),

    /// Literal de entero.
    IntLiteral(u64),

    /// `=`
    Assign,

    /// `+=`
    PlusAssign,

    /// `-=`
    MinusAssign,

    /// `*=`
    TimesAssign,

    /// `/=`
    DivideAssign,

    /// `<<=`
    ShlAssign,

    /// `>>=`
    ShrAssign,

    /// `&=`
    AndAssign,

    /// `|=`
    OrAssign,

    /// `+`
    Plus,

    /// `-`
    Minus,

    /// `*`
    Times,

    /// `/`
    Divide,

    /// `<<`
    Shl,

    /// `>>`
    Shr,

    /// `&`
    BitAnd,

    /// `|`
    BitOr,

    /// `<`
    Less,

    /// `<=`
    LessEq,

    /// `>`
    Greater,

    /// `>=`
    GreaterEq,

    /// `==`
    Equal,

    /// `!=`
    NotEqual,

    /// `:`
    Colon,

    /// `,`
    Comma,

    /// `(`
    OpenParen,

    /// `)`
    CloseParen,

    /// `@`
    At,

    /// Fin de línea lógica.
    Newline,

    /// Apertura de bloque indentado.
    Indent,

    /// Cierre de bloque indentado.
    Dedent,
}

impl Display for Token {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Token::*;

        match self {
            Id(id) => write!(fmt, "identifier `{}`", id),
            Keyword(keyword) => write!(fmt, "keyword `{}`", keyword),
            IntLiteral(integer) => write!(fmt, "literal `{}`", integer),
            Assign => fmt.write_str("`=`"),
            PlusAssign => fmt.write_str("`+=`"),
            MinusAssign => fmt.write_str("`-=`"),
            TimesAssign => fmt.write_str("`*=`"),
            DivideAssign => fmt.write_str("`/=`"),
            ShlAssign => fmt.write_str("`<<=`"),
            ShrAssign => fmt.write_str("`>>=`"),
            AndAssign => fmt.write_str("`&=`"),
            OrAssign => fmt.write_str("`|=`"),
            Plus => fmt.write_str("`+`"),
            Minus => fmt.write_str("`-`"),
            Times => fmt.write_str("`*`"),
            Divide => fmt.write_str("`/`"),
            Shl => fmt.write_str("`<<`"),
            Shr => fmt.write_str("`>>`"),
            BitAnd => fmt.write_str("`&`"),
            BitOr => fmt.write_str("`|`"),
            Less => fmt.write_str("`<`"),
            LessEq => fmt.write_str("`<=`"),
            Greater => fmt.write_str("`>`"),
            GreaterEq => fmt.write_str("`>=`"),
            Equal => fmt.write_str("`==`"),
            NotEqual => fmt.write_str("`!=`"),
            Colon => fmt.write_str("`:`"),
            Comma => fmt.write_str("`,`"),
            OpenParen => fmt.write_str("`(`"),
            CloseParen => fmt.write_str("`)`"),
            At => fmt.write_str("`@`"),
            Newline => fmt.write_str("end of line"),
            Indent => fmt.write_str("indent"),
            Dedent => fmt.write_str("dedent"),
        }
    }
}

/// Una palabra clave.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Keyword {
    If,
    Elif,
    Else,
    While,
    Break,
    Pass,
    Def,
    Return,
    Not,
    And,
    Or,
    True,
    False,
}

impl Display for Keyword {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Keyword::*;
        let string = match self {
            If     => "if",
            Elif   => "elif",
            Else   => "else",
            While  => "while",
            Break  => "break",
            Pass   => "pass",
            Def    => "def",
            Return => "return",
            Not    => "not",
            And    => "and",
            Or     => "or",
            True   => "True",
            False  => "False",
        };

        fmt.write_str(string)
    }
}

impl FromStr for Keyword {
    type Err = ();

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        use Keyword::*;

        const KEYWORDS: &[(&str, Keyword)] = &[
            ("if",     If),
            ("elif",   Elif),
            ("else",   Else),
            ("while",  While),
            ("break",  Break),
            ("pass",   Pass),
            ("def",    Def),
            ("return", Return),
            ("not",    Not),
            ("and",    And),
            ("or",     Or),
            ("True",   True),
            ("False",  False),
        ];

        KEYWORDS
            .iter()
            .find(|&&(name, _)| name == string)
            .map(|&(_, keyword)| keyword)
            .ok_or(())
    }
}

/// Reduce las líneas pre-procesadas a una secuencia de tokens.
pub fn tokenize(lines: &[String]) -> Result<Vec<Located<Token>>, Located<LexerError>> {
    let mut tokens = Vec::new();
    let mut indents = vec![0u32];

    for (index, raw) in lines.iter().enumerate() {
        let line_no = index as u32 + 1;

        // Los comentarios descartan el resto de la línea donde ocurren
        let line = match raw.find('#') {
            Some(cut) => &raw[..cut],
            None => raw.as_str(),
        };

        if line.trim().is_empty() {
            continue;
        }

        let indent = measure_indent(line, line_no)?;
        let at_line_start = Location::single(Position::new(line_no, 1));

        if indent > *indents.last().unwrap() {
            indents.push(indent);
            tokens.push(Located::at(Token::Indent, at_line_start.clone()));
        } else {
            while indent < *indents.last().unwrap() {
                indents.pop();
                tokens.push(Located::at(Token::Dedent, at_line_start.clone()));
            }

            if indent != *indents.last().unwrap() {
                return Err(Located::at(LexerError::BadDedent, at_line_start));
            }
        }

        scan_line(line, line_no, &mut tokens)?;

        let eol = Location::single(Position::new(line_no, line.len() as u32 + 1));
        tokens.push(Located::at(Token::Newline, eol));
    }

    // Se cierran los bloques que quedaron abiertos al final del archivo
    let eof = Location::single(Position::new(lines.len() as u32 + 1, 1));
    while indents.pop().filter(|&level| level > 0).is_some() {
        tokens.push(Located::at(Token::Dedent, eof.clone()));
    }

    Ok(tokens)
}

/// Cuenta los espacios de indentación al inicio de una línea.
fn measure_indent(line: &str, line_no: u32) -> Result<u32, Located<LexerError>> {
    let mut indent = 0;
    for c in line.chars() {
        match c {
            ' ' => indent += 1,
            '\t' => {
                let at = Location::single(Position::new(line_no, indent + 1));
                return Err(Located::at(LexerError::TabIndent, at));
            }
            _ => break,
        }
    }

    Ok(indent)
}

/// Escanea los tokens de una sola línea.
fn scan_line(
    line: &str,
    line_no: u32,
    tokens: &mut Vec<Located<Token>>,
) -> Result<(), Located<LexerError>> {
    use Token::*;

    let chars: Vec<char> = line.chars().collect();
    let mut i = 0;

    let locate = |from: usize, to: usize| {
        Location::span(
            Location::single(Position::new(line_no, from as u32 + 1)),
            &Location::single(Position::new(line_no, to as u32)),
        )
    };

    while i < chars.len() {
        let start = i;
        let c = chars[i];

        let token = match c {
            ' ' => {
                i += 1;
                continue;
            }

            // Términos: identificadores y palabras clave
            _ if c.is_ascii_alphabetic() || c == '_' => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }

                let word: String = chars[start..i].iter().collect();
                match self::Keyword::from_str(&word) {
                    Ok(keyword) => Keyword(keyword),
                    Err(()) => Id(word),
                }
            }

            // Constantes enteras, decimales o `0x` hexadecimales
            _ if c.is_ascii_digit() => {
                let hex = c == '0' && matches!(chars.get(i + 1), Some('x') | Some('X'));
                if hex {
                    i += 2;
                }

                let digits = i;
                while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                    i += 1;
                }

                let word: String = chars[digits..i].iter().collect();
                let value = if hex {
                    u64::from_str_radix(&word, 16)
                } else {
                    word.parse::<u64>()
                };

                match value {
                    Ok(value) => IntLiteral(value),
                    Err(_) => {
                        return Err(Located::at(LexerError::IntOverflow, locate(start, i)))
                    }
                }
            }

            '(' => simple(&mut i, OpenParen),
            ')' => simple(&mut i, CloseParen),
            ':' => simple(&mut i, Colon),
            ',' => simple(&mut i, Comma),
            '@' => simple(&mut i, At),

            // Operadores de uno o dos caracteres, con variante `=`
            '+' => twofold(&mut i, &chars, Plus, PlusAssign),
            '-' => twofold(&mut i, &chars, Minus, MinusAssign),
            '*' => twofold(&mut i, &chars, Times, TimesAssign),
            '/' => twofold(&mut i, &chars, Divide, DivideAssign),
            '&' => twofold(&mut i, &chars, BitAnd, AndAssign),
            '|' => twofold(&mut i, &chars, BitOr, OrAssign),
            '=' => twofold(&mut i, &chars, Assign, Equal),

            '<' => match chars.get(i + 1) {
                Some('<') => {
                    i += 1;
                    twofold(&mut i, &chars, Shl, ShlAssign)
                }
                Some('=') => {
                    i += 2;
                    LessEq
                }
                _ => simple(&mut i, Less),
            },

            '>' => match chars.get(i + 1) {
                Some('>') => {
                    i += 1;
                    twofold(&mut i, &chars, Shr, ShrAssign)
                }
                Some('=') => {
                    i += 2;
                    GreaterEq
                }
                _ => simple(&mut i, Greater),
            },

            '!' => match chars.get(i + 1) {
                Some('=') => {
                    i += 2;
                    NotEqual
                }
                _ => return Err(Located::at(LexerError::Expected('='), locate(start, i + 1))),
            },

            other => {
                return Err(Located::at(LexerError::BadChar(other), locate(start, i + 1)))
            }
        };

        tokens.push(Located::at(token, locate(start, i)));
    }

    Ok(())
}

/// Consume un token de un solo carácter.
fn simple(i: &mut usize, token: Token) -> Token {
    *i += 1;
    token
}

/// Consume un operador que puede llevar `=` adosado.
fn twofold(i: &mut usize, chars: &[char], bare: Token, with_assign: Token) -> Token {
    if chars.get(*i + 1) == Some(&'=') {
        *i += 2;
        with_assign
    } else {
        *i += 1;
        bare
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        let lines: Vec<String> = source.lines().map(String::from).collect();
        tokenize(&lines)
            .unwrap()
            .into_iter()
            .map(Located::into_inner)
            .collect()
    }

    #[test]
    fn scans_assignment() {
        use Token::*;
        assert_eq!(
            kinds("x = 0x10"),
            vec![Id("x".into()), Assign, IntLiteral(16), Newline],
        );
    }

    #[test]
    fn scans_augmented_operators() {
        use Token::*;
        assert_eq!(
            kinds("k += 1\nk <<= 2"),
            vec![
                Id("k".into()),
                PlusAssign,
                IntLiteral(1),
                Newline,
                Id("k".into()),
                ShlAssign,
                IntLiteral(2),
                Newline,
            ],
        );
    }

    #[test]
    fn emits_indent_and_dedent() {
        use Token::*;
        let tokens = kinds("while k < 10:\n    k += 1\nx = 0");

        assert!(tokens.contains(&Indent));
        assert!(tokens.contains(&Dedent));

        let indent = tokens.iter().position(|t| *t == Indent).unwrap();
        let dedent = tokens.iter().position(|t| *t == Dedent).unwrap();
        assert!(indent < dedent);
    }

    #[test]
    fn closes_blocks_at_eof() {
        use Token::*;
        let tokens = kinds("if x > 1:\n    pass");
        assert_eq!(tokens.last(), Some(&Dedent));
    }

    #[test]
    fn strips_comments() {
        use Token::*;
        assert_eq!(kinds("x = 1  # trailing"), vec![Id("x".into()), Assign, IntLiteral(1), Newline]);
    }

    #[test]
    fn rejects_stray_bang() {
        let lines = vec![String::from("x ! y")];
        assert!(matches!(
            tokenize(&lines).unwrap_err().into_inner(),
            LexerError::Expected('='),
        ));
    }
}
