use crate::{lex::LexerError, parse::ParserError, source::Located};
use thiserror::Error;

/// Resultado estándar de las fases de compilación.
pub type Compile<T> = Result<T, CompileError>;

/// Error único que una compilación puede reportar.
///
/// Toda falla de cualquier fase (pre-procesado, léxico, sintáctico,
/// emisión, enlace de llamadas) se convierte en una de estas variantes
/// antes de cruzar la frontera de la biblioteca. Nunca se retorna un
/// programa parcial junto a un error.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CompileError {
    /// Error de escaneo, con la línea donde ocurrió.
    #[error("line {line}: {error}")]
    Lexer { line: u32, error: LexerError },

    /// Error sintáctico, con la línea donde ocurrió.
    #[error("line {line}: {error}")]
    Parser { line: u32, error: ParserError },

    /// Constructo fuera del subconjunto soportado del lenguaje.
    #[error("line {line}: unsupported construct: {what}")]
    Syntax { line: u32, what: String },

    /// Uso de un nombre que no resuelve a ningún símbolo.
    #[error("line {line}: symbol `{name}` is undefined")]
    Undeclared { line: u32, name: String },

    /// El símbolo existe pero no es de la clase esperada.
    #[error("line {line}: symbol `{name}` is not a {expected}")]
    TypeMismatch {
        line: u32,
        name: String,
        expected: &'static str,
    },

    /// Intento de declarar un nombre ya ocupado.
    #[error("line {line}: symbol `{name}` already exists")]
    Redeclaration { line: u32, name: String },

    /// El grafo estático de llamadas contiene un ciclo.
    #[error("recursion is not supported: {}", names.join(" -> "))]
    Recursion { names: Vec<String> },

    /// Se exigió el valor de una función que nunca retorna uno.
    #[error("line {line}: function `{name}` does not return a value")]
    MissingReturn { line: u32, name: String },

    /// Llamada a una función que nunca fue definida.
    #[error("line {line}: call to undefined function `{name}`")]
    UnresolvedCall { line: u32, name: String },

    /// Pragma con nombre o valor fuera del conjunto permitido.
    #[error("line {line}: bad value `{value}` for compiler flag `{name}`")]
    BadPragma {
        line: u32,
        name: String,
        value: String,
    },
}

impl From<Located<LexerError>> for CompileError {
    fn from(error: Located<LexerError>) -> Self {
        let (location, error) = error.split();
        CompileError::Lexer {
            line: location.line(),
            error,
        }
    }
}

impl From<Located<ParserError>> for CompileError {
    fn from(error: Located<ParserError>) -> Self {
        let (location, error) = error.split();
        CompileError::Parser {
            line: location.line(),
            error,
        }
    }
}
