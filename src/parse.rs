//! Análisis sintáctico.

use std::fmt::{self, Display};
use thiserror::Error;

use crate::{
    lex::{Keyword, Token},
    source::{Located, Location},
};

/// Programa completo: la secuencia de sentencias del módulo.
#[derive(Debug, Clone)]
pub struct Program {
    pub body: Vec<Stmt>,
}

/// Una sentencia con su línea de origen.
#[derive(Debug, Clone)]
pub struct Stmt {
    pub line: u32,
    pub kind: StmtKind,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Assign {
        target: String,
        value: Expr,
    },

    AugAssign {
        target: String,
        op: BinaryOp,
        value: Expr,
    },

    /// Llamada en posición de sentencia.
    Call(Call),

    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
    },

    While {
        test: Expr,
        body: Vec<Stmt>,
    },

    Break,
    Pass,

    FunctionDef(FunctionDef),

    Return {
        value: Option<Expr>,
    },
}

/// Definición de función de usuario.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    /// Valores por defecto de los parámetros de palabra clave.
    pub defaults: Vec<(String, u64)>,
    pub inline: bool,
    pub body: Vec<Stmt>,
    pub line: u32,
}

/// Una expresión con su línea de origen.
#[derive(Debug, Clone)]
pub struct Expr {
    pub line: u32,
    pub kind: ExprKind,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Int(u64),
    Name(String),

    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// Comparación encadenada: `left OP1 e1 OP2 e2 ...`.
    Compare {
        left: Box<Expr>,
        comparisons: Vec<(CompareOp, Expr)>,
    },

    BoolOp {
        op: BoolOp,
        values: Vec<Expr>,
    },

    Not(Box<Expr>),

    Call(Call),
}

/// Llamada a función o primitiva.
#[derive(Debug, Clone)]
pub struct Call {
    pub name: String,
    pub args: Vec<Expr>,
    pub kwargs: Vec<(String, Expr)>,
    pub line: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Shl,
    Shr,
    BitAnd,
    BitOr,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Equal,
    NotEqual,
}

impl Display for CompareOp {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            CompareOp::Less => "<",
            CompareOp::LessEq => "<=",
            CompareOp::Greater => ">",
            CompareOp::GreaterEq => ">=",
            CompareOp::Equal => "==",
            CompareOp::NotEqual => "!=",
        };

        fmt.write_str(string)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ParserError {
    #[error("Expected token {0}, found {1} instead")]
    UnexpectedToken(Token, Token),

    #[error("Expected token {0}, none was found instead")]
    MissingToken(Token),

    #[error("Expected identifier")]
    ExpectedId,

    #[error("Expected a statement")]
    ExpectedStatement,

    #[error("Expected an expression")]
    ExpectedExpr,

    #[error("Unary operators are only supported on integer literals")]
    UnaryLiteral,

    #[error("Unknown decorator `{0}`")]
    BadDecorator(String),

    #[error("Function definitions are only allowed at module level")]
    NestedFunction,

    #[error("Positional argument follows keyword argument")]
    PositionalAfterKeyword,

    #[error("Default parameter values must be integer literals")]
    BadDefault,

    #[error("Non-default parameter follows a default parameter")]
    DefaultOrder,

    #[error("Abrupt end of program")]
    UnexpectedEof,
}

type Parse<T> = Result<T, Located<ParserError>>;

/// Dispone el flujo de tokens en un árbol sintáctico.
pub fn parse(tokens: Vec<Located<Token>>) -> Parse<Program> {
    let mut parser = Parser {
        tokens,
        position: 0,
        last_known: Location::default(),
    };

    let body = parser.statements(false)?;
    match parser.peek() {
        None => Ok(Program { body }),
        Some(_) => parser.fail(ParserError::ExpectedStatement),
    }
}

struct Parser {
    tokens: Vec<Located<Token>>,
    position: usize,
    last_known: Location,
}

impl Parser {
    /// Secuencia de sentencias al nivel de indentación actual.
    fn statements(&mut self, in_function: bool) -> Parse<Vec<Stmt>> {
        let mut statements = Vec::new();
        loop {
            match self.peek() {
                None | Some(Token::Dedent) => break Ok(statements),
                _ => statements.push(self.statement(in_function)?),
            }
        }
    }

    fn statement(&mut self, in_function: bool) -> Parse<Stmt> {
        let line = self.next_line();

        match self.peek().ok_or_else(|| self.eof())?.clone() {
            Token::Keyword(Keyword::If) => self.if_statement(in_function),
            Token::Keyword(Keyword::While) => self.while_statement(in_function),
            Token::At | Token::Keyword(Keyword::Def) => self.function_def(in_function),

            _ => {
                let statement = self.simple_statement(line)?;
                self.expect(Token::Newline)?;
                Ok(statement)
            }
        }
    }

    /// Sentencia sin bloque anidado; no consume el fin de línea.
    fn simple_statement(&mut self, line: u32) -> Parse<Stmt> {
        let kind = match self.peek().ok_or_else(|| self.eof())?.clone() {
            Token::Keyword(Keyword::Break) => {
                self.advance();
                StmtKind::Break
            }

            Token::Keyword(Keyword::Pass) => {
                self.advance();
                StmtKind::Pass
            }

            Token::Keyword(Keyword::Return) => {
                self.advance();
                let value = match self.peek() {
                    Some(Token::Newline) => None,
                    _ => Some(self.test()?),
                };

                StmtKind::Return { value }
            }

            Token::Id(name) => {
                self.advance();
                match self.peek() {
                    Some(Token::Assign) => {
                        self.advance();
                        let value = self.test()?;
                        StmtKind::Assign {
                            target: name,
                            value,
                        }
                    }

                    Some(Token::OpenParen) => {
                        let call = self.call_suffix(name, line)?;
                        StmtKind::Call(call)
                    }

                    other => {
                        let op = match other {
                            Some(Token::PlusAssign) => BinaryOp::Add,
                            Some(Token::MinusAssign) => BinaryOp::Sub,
                            Some(Token::TimesAssign) => BinaryOp::Mul,
                            Some(Token::DivideAssign) => BinaryOp::Div,
                            Some(Token::ShlAssign) => BinaryOp::Shl,
                            Some(Token::ShrAssign) => BinaryOp::Shr,
                            Some(Token::AndAssign) => BinaryOp::BitAnd,
                            Some(Token::OrAssign) => BinaryOp::BitOr,
                            _ => return self.fail(ParserError::ExpectedStatement),
                        };

                        self.advance();
                        let value = self.test()?;
                        StmtKind::AugAssign {
                            target: name,
                            op,
                            value,
                        }
                    }
                }
            }

            _ => return self.fail(ParserError::ExpectedStatement),
        };

        Ok(Stmt { line, kind })
    }

    /// Bloque de un constructo compuesto: `:` seguido de o bien una
    /// sentencia simple en la misma línea o un bloque indentado.
    fn block(&mut self, in_function: bool) -> Parse<Vec<Stmt>> {
        self.expect(Token::Colon)?;

        if self.peek() == Some(&Token::Newline) {
            self.advance();
            self.expect(Token::Indent)?;
            let statements = self.statements(in_function)?;
            self.expect(Token::Dedent)?;

            Ok(statements)
        } else {
            let line = self.next_line();
            let statement = self.simple_statement(line)?;
            self.expect(Token::Newline)?;

            Ok(vec![statement])
        }
    }

    fn if_statement(&mut self, in_function: bool) -> Parse<Stmt> {
        let line = self.next_line();

        // Acepta tanto `if` como `elif`: un `elif` es exactamente un
        // `if` anidado en la rama else del anterior.
        match self.peek() {
            Some(Token::Keyword(Keyword::Elif)) => self.keyword(Keyword::Elif)?,
            _ => self.keyword(Keyword::If)?,
        };

        let test = self.test()?;
        let body = self.block(in_function)?;

        let orelse = match self.peek() {
            Some(Token::Keyword(Keyword::Elif)) => vec![self.if_statement(in_function)?],

            Some(Token::Keyword(Keyword::Else)) => {
                self.advance();
                self.block(in_function)?
            }

            _ => Vec::new(),
        };

        Ok(Stmt {
            line,
            kind: StmtKind::If { test, body, orelse },
        })
    }

    fn while_statement(&mut self, in_function: bool) -> Parse<Stmt> {
        let line = self.next_line();
        self.keyword(Keyword::While)?;

        let test = self.test()?;
        let body = self.block(in_function)?;

        Ok(Stmt {
            line,
            kind: StmtKind::While { test, body },
        })
    }

    fn function_def(&mut self, in_function: bool) -> Parse<Stmt> {
        if in_function {
            return self.fail(ParserError::NestedFunction);
        }

        let line = self.next_line();

        let inline = match self.peek() {
            Some(Token::At) => {
                self.advance();
                let decorator = self.id()?;
                self.expect(Token::Newline)?;

                match decorator.as_ref().as_str() {
                    "inline" => true,
                    other => {
                        return Err(Located::at(
                            ParserError::BadDecorator(other.to_string()),
                            decorator.location().clone(),
                        ))
                    }
                }
            }

            _ => false,
        };

        self.keyword(Keyword::Def)?;
        let name = self.id()?.into_inner();

        self.expect(Token::OpenParen)?;

        let mut params = Vec::new();
        let mut defaults = Vec::new();
        if self.peek() != Some(&Token::CloseParen) {
            loop {
                let param = self.id()?.into_inner();
                if self.peek() == Some(&Token::Assign) {
                    self.advance();
                    let value = match self.peek().cloned() {
                        Some(Token::IntLiteral(value)) => {
                            self.advance();
                            value
                        }
                        Some(Token::Keyword(Keyword::True)) => {
                            self.advance();
                            1
                        }
                        Some(Token::Keyword(Keyword::False)) => {
                            self.advance();
                            0
                        }
                        _ => return self.fail(ParserError::BadDefault),
                    };

                    defaults.push((param.clone(), value));
                } else if !defaults.is_empty() {
                    return self.fail(ParserError::DefaultOrder);
                }

                params.push(param);
                match self.peek() {
                    Some(Token::Comma) => {
                        self.advance();
                    }
                    _ => break,
                }
            }
        }

        self.expect(Token::CloseParen)?;
        let body = self.block(true)?;

        Ok(Stmt {
            line,
            kind: StmtKind::FunctionDef(FunctionDef {
                name,
                params,
                defaults,
                inline,
                body,
                line,
            }),
        })
    }

    /// Expresión de prueba: conectivas `or` al nivel más bajo.
    fn test(&mut self) -> Parse<Expr> {
        let line = self.next_line();
        let first = self.and_expr()?;

        if self.peek() != Some(&Token::Keyword(Keyword::Or)) {
            return Ok(first);
        }

        let mut values = vec![first];
        while self.peek() == Some(&Token::Keyword(Keyword::Or)) {
            self.advance();
            values.push(self.and_expr()?);
        }

        Ok(Expr {
            line,
            kind: ExprKind::BoolOp {
                op: BoolOp::Or,
                values,
            },
        })
    }

    fn and_expr(&mut self) -> Parse<Expr> {
        let line = self.next_line();
        let first = self.not_expr()?;

        if self.peek() != Some(&Token::Keyword(Keyword::And)) {
            return Ok(first);
        }

        let mut values = vec![first];
        while self.peek() == Some(&Token::Keyword(Keyword::And)) {
            self.advance();
            values.push(self.not_expr()?);
        }

        Ok(Expr {
            line,
            kind: ExprKind::BoolOp {
                op: BoolOp::And,
                values,
            },
        })
    }

    fn not_expr(&mut self) -> Parse<Expr> {
        let line = self.next_line();

        if self.peek() == Some(&Token::Keyword(Keyword::Not)) {
            self.advance();
            let operand = self.not_expr()?;

            Ok(Expr {
                line,
                kind: ExprKind::Not(Box::new(operand)),
            })
        } else {
            self.comparison()
        }
    }

    fn comparison(&mut self) -> Parse<Expr> {
        let line = self.next_line();
        let left = self.bit_or()?;

        let mut comparisons = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Less) => CompareOp::Less,
                Some(Token::LessEq) => CompareOp::LessEq,
                Some(Token::Greater) => CompareOp::Greater,
                Some(Token::GreaterEq) => CompareOp::GreaterEq,
                Some(Token::Equal) => CompareOp::Equal,
                Some(Token::NotEqual) => CompareOp::NotEqual,
                _ => break,
            };

            self.advance();
            comparisons.push((op, self.bit_or()?));
        }

        if comparisons.is_empty() {
            Ok(left)
        } else {
            Ok(Expr {
                line,
                kind: ExprKind::Compare {
                    left: Box::new(left),
                    comparisons,
                },
            })
        }
    }

    fn bit_or(&mut self) -> Parse<Expr> {
        self.binary_chain(
            &[(Token::BitOr, BinaryOp::BitOr)],
            Self::bit_and,
        )
    }

    fn bit_and(&mut self) -> Parse<Expr> {
        self.binary_chain(&[(Token::BitAnd, BinaryOp::BitAnd)], Self::shift)
    }

    fn shift(&mut self) -> Parse<Expr> {
        self.binary_chain(
            &[(Token::Shl, BinaryOp::Shl), (Token::Shr, BinaryOp::Shr)],
            Self::arith,
        )
    }

    fn arith(&mut self) -> Parse<Expr> {
        self.binary_chain(
            &[(Token::Plus, BinaryOp::Add), (Token::Minus, BinaryOp::Sub)],
            Self::term,
        )
    }

    fn term(&mut self) -> Parse<Expr> {
        self.binary_chain(
            &[(Token::Times, BinaryOp::Mul), (Token::Divide, BinaryOp::Div)],
            Self::factor,
        )
    }

    /// Cadena binaria izquierda-asociativa de un nivel de precedencia.
    fn binary_chain<F>(&mut self, table: &[(Token, BinaryOp)], mut next: F) -> Parse<Expr>
    where
        F: FnMut(&mut Self) -> Parse<Expr>,
    {
        let line = self.next_line();
        let mut left = next(self)?;

        loop {
            let op = table
                .iter()
                .find(|(token, _)| self.peek() == Some(token))
                .map(|&(_, op)| op);

            match op {
                None => break Ok(left),
                Some(op) => {
                    self.advance();
                    let right = next(self)?;

                    left = Expr {
                        line,
                        kind: ExprKind::Binary {
                            left: Box::new(left),
                            op,
                            right: Box::new(right),
                        },
                    };
                }
            }
        }
    }

    fn factor(&mut self) -> Parse<Expr> {
        let line = self.next_line();

        match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                let operand = self.factor()?;
                match operand.kind {
                    // El negativo de un literal se pliega a complemento a dos
                    ExprKind::Int(value) => Ok(Expr {
                        line,
                        kind: ExprKind::Int(value.wrapping_neg()),
                    }),
                    _ => self.fail(ParserError::UnaryLiteral),
                }
            }

            Some(Token::Plus) => {
                self.advance();
                let operand = self.factor()?;
                match operand.kind {
                    ExprKind::Int(_) => Ok(operand),
                    _ => self.fail(ParserError::UnaryLiteral),
                }
            }

            _ => self.atom(),
        }
    }

    fn atom(&mut self) -> Parse<Expr> {
        let line = self.next_line();

        match self.peek().cloned() {
            Some(Token::IntLiteral(value)) => {
                self.advance();
                Ok(Expr {
                    line,
                    kind: ExprKind::Int(value),
                })
            }

            Some(Token::Keyword(Keyword::True)) => {
                self.advance();
                Ok(Expr {
                    line,
                    kind: ExprKind::Int(1),
                })
            }

            Some(Token::Keyword(Keyword::False)) => {
                self.advance();
                Ok(Expr {
                    line,
                    kind: ExprKind::Int(0),
                })
            }

            Some(Token::Id(name)) => {
                self.advance();
                if self.peek() == Some(&Token::OpenParen) {
                    let call = self.call_suffix(name, line)?;
                    Ok(Expr {
                        line,
                        kind: ExprKind::Call(call),
                    })
                } else {
                    Ok(Expr {
                        line,
                        kind: ExprKind::Name(name),
                    })
                }
            }

            Some(Token::OpenParen) => {
                self.advance();
                let inner = self.test()?;
                self.expect(Token::CloseParen)?;
                Ok(inner)
            }

            _ => self.fail(ParserError::ExpectedExpr),
        }
    }

    /// Lista de argumentos tras el nombre de una llamada.
    fn call_suffix(&mut self, name: String, line: u32) -> Parse<Call> {
        self.expect(Token::OpenParen)?;

        let mut args = Vec::new();
        let mut kwargs: Vec<(String, Expr)> = Vec::new();

        if self.peek() != Some(&Token::CloseParen) {
            loop {
                // `id =` introduce un argumento de palabra clave
                let keyword = match (self.peek(), self.peek_at(1)) {
                    (Some(Token::Id(keyword)), Some(Token::Assign)) => Some(keyword.clone()),
                    _ => None,
                };

                match keyword {
                    Some(keyword) => {
                        self.advance();
                        self.advance();
                        kwargs.push((keyword, self.test()?));
                    }

                    None => {
                        if !kwargs.is_empty() {
                            return self.fail(ParserError::PositionalAfterKeyword);
                        }

                        args.push(self.test()?);
                    }
                }

                match self.peek() {
                    Some(Token::Comma) => {
                        self.advance();
                    }
                    _ => break,
                }
            }
        }

        self.expect(Token::CloseParen)?;

        Ok(Call {
            name,
            args,
            kwargs,
            line,
        })
    }

    fn id(&mut self) -> Parse<Located<String>> {
        let (location, token) = self.next()?.split();
        match token {
            Token::Id(id) => Ok(Located::at(id, location)),
            _ => self.fail(ParserError::ExpectedId),
        }
    }

    fn keyword(&mut self, keyword: Keyword) -> Parse<()> {
        self.expect(Token::Keyword(keyword))
    }

    fn expect(&mut self, token: Token) -> Parse<()> {
        match self.next().map(Located::into_inner) {
            Ok(found) if found == token => Ok(()),
            Ok(found) => self.fail(ParserError::UnexpectedToken(token, found)),
            Err(_) => self.fail(ParserError::MissingToken(token)),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position).map(Located::val)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.position + ahead).map(Located::val)
    }

    /// Línea del siguiente token, o de la última conocida al final.
    fn next_line(&self) -> u32 {
        self.tokens
            .get(self.position)
            .map(|token| token.location().line())
            .unwrap_or_else(|| self.last_known.line())
    }

    fn next(&mut self) -> Parse<Located<Token>> {
        match self.tokens.get(self.position) {
            Some(token) => {
                self.position += 1;
                self.last_known = token.location().clone();
                Ok(token.clone())
            }

            None => self.fail(ParserError::UnexpectedEof),
        }
    }

    fn advance(&mut self) {
        if let Some(token) = self.tokens.get(self.position) {
            self.last_known = token.location().clone();
            self.position += 1;
        }
    }

    fn eof(&self) -> Located<ParserError> {
        Located::at(ParserError::UnexpectedEof, self.last_known.clone())
    }

    fn fail<T>(&self, error: ParserError) -> Parse<T> {
        Err(Located::at(error, self.last_known.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lex::tokenize;

    fn parse_source(source: &str) -> Program {
        let lines: Vec<String> = source.lines().map(String::from).collect();
        parse(tokenize(&lines).unwrap()).unwrap()
    }

    #[test]
    fn parses_assignment_chain() {
        let program = parse_source("x = 1 + 2 + y");
        assert_eq!(program.body.len(), 1);

        match &program.body[0].kind {
            StmtKind::Assign { target, value } => {
                assert_eq!(target, "x");
                // Asociatividad izquierda: (1 + 2) + y
                match &value.kind {
                    ExprKind::Binary { left, op, right } => {
                        assert_eq!(*op, BinaryOp::Add);
                        assert!(matches!(left.kind, ExprKind::Binary { .. }));
                        assert!(matches!(&right.kind, ExprKind::Name(n) if n == "y"));
                    }
                    other => panic!("unexpected rhs: {:?}", other),
                }
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn parses_elif_as_nested_if() {
        let program = parse_source(
            "if x > 1:\n    pass\nelif x > 2:\n    pass\nelse:\n    pass",
        );

        match &program.body[0].kind {
            StmtKind::If { orelse, .. } => {
                assert_eq!(orelse.len(), 1);
                match &orelse[0].kind {
                    StmtKind::If { orelse, .. } => assert_eq!(orelse.len(), 1),
                    other => panic!("elif did not nest: {:?}", other),
                }
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn parses_inline_suite() {
        let program = parse_source("if x > 5: return x");
        match &program.body[0].kind {
            StmtKind::If { body, .. } => {
                assert!(matches!(body[0].kind, StmtKind::Return { .. }));
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn parses_decorated_def_with_defaults() {
        let program = parse_source("@inline\ndef f(x, gate=1):\n    return x");
        match &program.body[0].kind {
            StmtKind::FunctionDef(def) => {
                assert!(def.inline);
                assert_eq!(def.params, vec!["x", "gate"]);
                assert_eq!(def.defaults, vec![(String::from("gate"), 1)]);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn parses_keyword_arguments() {
        let program = parse_source("pulse(shutter=main, duration=t)");
        match &program.body[0].kind {
            StmtKind::Call(call) => {
                assert_eq!(call.name, "pulse");
                assert!(call.args.is_empty());
                assert_eq!(call.kwargs.len(), 2);
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn folds_negative_literals() {
        let program = parse_source("x = -3");
        match &program.body[0].kind {
            StmtKind::Assign { value, .. } => {
                assert!(matches!(value.kind, ExprKind::Int(v) if v == 3u64.wrapping_neg()));
            }
            other => panic!("unexpected statement: {:?}", other),
        }
    }

    #[test]
    fn rejects_nested_def() {
        let lines: Vec<String> = "def f():\n    def g():\n        pass"
            .lines()
            .map(String::from)
            .collect();

        let result = parse(tokenize(&lines).unwrap());
        assert!(matches!(
            result.unwrap_err().into_inner(),
            ParserError::NestedFunction,
        ));
    }
}
