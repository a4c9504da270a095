//! Evaluador de referencia.
//!
//! Interpreta directamente el AST de ppp sobre un ambiente de
//! variables, con los mismos valores iniciales que el encabezado y el
//! mismo modelo de hardware determinista que la máquina virtual. El
//! diccionario final de variables es la verdad de base contra la que
//! se valida la salida del compilador, restringida a los nombres
//! declarados por el usuario.

use std::collections::HashMap;

use thiserror::Error;

use crate::{
    builtins,
    hardware::FakeHardware,
    parse::{
        BinaryOp, BoolOp, Call, CompareOp, Expr, ExprKind, FunctionDef, Program, Stmt, StmtKind,
    },
    vm::{word_div, word_shl, word_shr},
};

/// Pasos de evaluación máximos antes de declarar al programa colgado.
const STEP_LIMIT: u64 = 10_000_000;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("line {line}: name `{name}` is undefined")]
    Undefined { line: u32, name: String },

    #[error("line {line}: call to undefined function `{name}`")]
    UndefinedFunction { line: u32, name: String },

    #[error("line {line}: unsupported expression")]
    Unsupported { line: u32 },

    #[error("evaluation exceeded {0} steps")]
    StepLimit(u64),
}

/// Ejecuta el programa y retorna el estado final de las variables.
pub fn run(
    program: &Program,
    initials: &HashMap<String, u64>,
) -> Result<HashMap<String, u64>, EvalError> {
    let mut evaluator = Evaluator {
        globals: initials.clone(),
        functions: HashMap::new(),
        locals: HashMap::new(),
        hardware: FakeHardware::new(),
        steps: 0,
    };

    // Las definiciones son estáticas: se registran antes de ejecutar,
    // igual que el compilador resuelve llamadas hacia adelante
    for statement in &program.body {
        if let StmtKind::FunctionDef(def) = &statement.kind {
            evaluator.register(def);
        }
    }

    evaluator.exec_block(&program.body, &None)?;
    Ok(evaluator.globals)
}

enum Flow {
    Normal,
    Break,
    Return(Option<u64>),
    Exit,
}

struct Evaluator<'a> {
    globals: HashMap<String, u64>,
    functions: HashMap<String, &'a FunctionDef>,
    /// Ambientes locales persistentes, uno por función, igual que las
    /// variables planas `f_x` del modelo compilado.
    locals: HashMap<String, HashMap<String, u64>>,
    hardware: FakeHardware,
    steps: u64,
}

impl<'a> Evaluator<'a> {
    fn register(&mut self, def: &'a FunctionDef) {
        let defaults: HashMap<&str, u64> = def
            .defaults
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
            .collect();

        let locals = def
            .params
            .iter()
            .map(|param| {
                (
                    param.clone(),
                    defaults.get(param.as_str()).copied().unwrap_or(0),
                )
            })
            .collect();

        self.locals.insert(def.name.clone(), locals);
        self.functions.insert(def.name.clone(), def);
    }

    fn exec_block(&mut self, statements: &[Stmt], scope: &Option<String>) -> Result<Flow, EvalError> {
        for statement in statements {
            match self.exec(statement, scope)? {
                Flow::Normal => (),
                other => return Ok(other),
            }
        }

        Ok(Flow::Normal)
    }

    fn exec(&mut self, statement: &Stmt, scope: &Option<String>) -> Result<Flow, EvalError> {
        self.steps += 1;
        if self.steps > STEP_LIMIT {
            return Err(EvalError::StepLimit(STEP_LIMIT));
        }

        match &statement.kind {
            StmtKind::Assign { target, value } => {
                let value = self.eval(value, scope)?;
                self.write(scope, target, value);
            }

            StmtKind::AugAssign { target, op, value } => {
                let current = self.read(scope, target, statement.line)?;
                let operand = self.eval(value, scope)?;
                self.write(scope, target, apply_binary(*op, current, operand));
            }

            StmtKind::Call(call) => {
                if let Flow::Exit = self.call(call, scope)?.1 {
                    return Ok(Flow::Exit);
                }
            }

            StmtKind::If { test, body, orelse } => {
                if self.eval_test(test, scope)? {
                    return self.exec_block(body, scope);
                } else {
                    return self.exec_block(orelse, scope);
                }
            }

            StmtKind::While { test, body } => {
                while self.eval_test(test, scope)? {
                    self.steps += 1;
                    if self.steps > STEP_LIMIT {
                        return Err(EvalError::StepLimit(STEP_LIMIT));
                    }

                    match self.exec_block(body, scope)? {
                        Flow::Normal => (),
                        Flow::Break => break,
                        other => return Ok(other),
                    }
                }
            }

            StmtKind::Break => return Ok(Flow::Break),
            StmtKind::Pass => (),
            StmtKind::FunctionDef(_) => (),

            StmtKind::Return { value } => {
                let value = match value {
                    Some(value) => Some(self.eval(value, scope)?),
                    None => None,
                };

                return Ok(Flow::Return(value));
            }
        }

        Ok(Flow::Normal)
    }

    fn eval(&mut self, expr: &Expr, scope: &Option<String>) -> Result<u64, EvalError> {
        match &expr.kind {
            ExprKind::Int(value) => Ok(*value),
            ExprKind::Name(name) => self.read(scope, name, expr.line),

            ExprKind::Binary { left, op, right } => {
                let left = self.eval(left, scope)?;
                let right = self.eval(right, scope)?;
                Ok(apply_binary(*op, left, right))
            }

            ExprKind::Call(call) => {
                let (value, _) = self.call(call, scope)?;
                Ok(value.unwrap_or(0))
            }

            ExprKind::Compare { .. } | ExprKind::BoolOp { .. } | ExprKind::Not(_) => {
                Err(EvalError::Unsupported { line: expr.line })
            }
        }
    }

    fn eval_test(&mut self, test: &Expr, scope: &Option<String>) -> Result<bool, EvalError> {
        match &test.kind {
            ExprKind::BoolOp { op, values } => {
                for value in values {
                    let truth = self.eval_test(value, scope)?;
                    match op {
                        BoolOp::And if !truth => return Ok(false),
                        BoolOp::Or if truth => return Ok(true),
                        _ => (),
                    }
                }

                Ok(matches!(op, BoolOp::And))
            }

            ExprKind::Not(inner) => Ok(!self.eval_test(inner, scope)?),

            ExprKind::Compare { left, comparisons } => {
                // Cadena `a OP1 b OP2 c`: conjunción por pares
                let mut left = self.eval(left, scope)?;
                for (op, right) in comparisons {
                    let right = self.eval(right, scope)?;
                    if !apply_compare(*op, left, right) {
                        return Ok(false);
                    }

                    left = right;
                }

                Ok(true)
            }

            _ => Ok(self.eval(test, scope)? > 0),
        }
    }

    /// Evalúa una llamada; retorna su valor y el flujo resultante.
    fn call(
        &mut self,
        call: &Call,
        scope: &Option<String>,
    ) -> Result<(Option<u64>, Flow), EvalError> {
        if builtins::is_builtin(&call.name) {
            return self.builtin(call, scope);
        }

        let def = match self.functions.get(call.name.as_str()) {
            Some(def) => *def,
            None => {
                return Err(EvalError::UndefinedFunction {
                    line: call.line,
                    name: call.name.clone(),
                })
            }
        };

        // Los argumentos se evalúan en el ámbito del llamador
        let mut bound: Vec<(String, u64)> = Vec::new();
        for (position, arg) in call.args.iter().enumerate() {
            let param = def.params.get(position).ok_or(EvalError::Unsupported {
                line: call.line,
            })?;

            bound.push((param.clone(), self.eval(arg, scope)?));
        }

        for (keyword, arg) in &call.kwargs {
            bound.push((keyword.clone(), self.eval(arg, scope)?));
        }

        let locals = self.locals.entry(def.name.clone()).or_default();
        for (param, value) in bound {
            locals.insert(param, value);
        }

        let callee = Some(def.name.clone());
        match self.exec_block(&def.body, &callee)? {
            Flow::Return(value) => Ok((value, Flow::Normal)),
            Flow::Exit => Ok((None, Flow::Exit)),
            _ => Ok((None, Flow::Normal)),
        }
    }

    /// Primitivas: solo las que producen valores o efectos observables
    /// por el estado final tienen semántica aquí; el resto no altera
    /// variable alguna.
    fn builtin(
        &mut self,
        call: &Call,
        scope: &Option<String>,
    ) -> Result<(Option<u64>, Flow), EvalError> {
        let value = match call.name.as_str() {
            "rand" => Some(self.hardware.rand()),
            "read_pipe" => Some(self.hardware.read_pipe()),
            "read_ram" => Some(self.hardware.read_ram()),

            "load_count" => {
                let channel = match call.args.first() {
                    Some(arg) => self.eval(arg, scope)?,
                    None => 0,
                };

                Some(self.hardware.load_count(channel))
            }

            "pipe_empty" => Some(self.hardware.pipe_empty() as u64),
            "ram_read_valid" => Some(self.hardware.ram_valid() as u64),

            "rand_seed" => {
                let seed = match call.args.first() {
                    Some(arg) => self.eval(arg, scope)?,
                    None => 0,
                };

                self.hardware.reseed(seed);
                None
            }

            "apply_next_scan_point" => {
                // Mismo patrón de drenado que la secuencia emitida: se
                // consumen pares hasta que el pipe queda vacío
                loop {
                    self.hardware.read_pipe();
                    self.hardware.read_pipe();

                    if self.hardware.pipe_empty() {
                        break;
                    }
                }

                None
            }

            "exit" => return Ok((None, Flow::Exit)),

            _ => None,
        };

        Ok((value, Flow::Normal))
    }

    fn read(&self, scope: &Option<String>, name: &str, line: u32) -> Result<u64, EvalError> {
        if let Some(function) = scope {
            if let Some(value) = self.locals.get(function).and_then(|locals| locals.get(name)) {
                return Ok(*value);
            }
        }

        self.globals
            .get(name)
            .copied()
            .ok_or_else(|| EvalError::Undefined {
                line,
                name: name.to_string(),
            })
    }

    /// Espeja la resolución de destinos del emisor: local si existe,
    /// luego global si existe, local nueva en caso contrario.
    fn write(&mut self, scope: &Option<String>, name: &str, value: u64) {
        if let Some(function) = scope {
            let has_local = self
                .locals
                .get(function)
                .map(|locals| locals.contains_key(name))
                .unwrap_or(false);

            if has_local || !self.globals.contains_key(name) {
                self.locals
                    .entry(function.clone())
                    .or_default()
                    .insert(name.to_string(), value);
                return;
            }
        }

        self.globals.insert(name.to_string(), value);
    }
}

fn apply_binary(op: BinaryOp, left: u64, right: u64) -> u64 {
    match op {
        BinaryOp::Add => left.wrapping_add(right),
        BinaryOp::Sub => left.wrapping_sub(right),
        BinaryOp::Mul => left.wrapping_mul(right),
        BinaryOp::Div => word_div(left, right),
        BinaryOp::Shl => word_shl(left, right),
        BinaryOp::Shr => word_shr(left, right),
        BinaryOp::BitAnd => left & right,
        BinaryOp::BitOr => left | right,
    }
}

fn apply_compare(op: CompareOp, left: u64, right: u64) -> bool {
    match op {
        CompareOp::Less => left < right,
        CompareOp::LessEq => left <= right,
        CompareOp::Greater => left > right,
        CompareOp::GreaterEq => left >= right,
        CompareOp::Equal => left == right,
        CompareOp::NotEqual => left != right,
    }
}
