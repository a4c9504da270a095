//! Emisión de código: recorrido del AST hacia líneas de ensamblador.
//!
//! El generador mantiene la disciplina de acumulador único del
//! procesador objetivo: toda expresión se evalúa de izquierda a
//! derecha dejando su resultado en el registro W, y el emisor lleva
//! cuenta de qué símbolo contiene W para elidir recargas redundantes.
//! Las llamadas a funciones de usuario se emiten como marcadores sin
//! resolver que un pase posterior reemplaza por el cuerpo empalmado o
//! por la secuencia de llamada y retorno.

use std::collections::{HashMap, HashSet};
use std::mem;

use log::debug;

use crate::{
    asm::{family_of, split_label, CallSite, Emitted, Line},
    builtins::{self, Arg, Effect},
    decl::{Flags, Options},
    error::{Compile, CompileError},
    parse::{
        BinaryOp, BoolOp, Call, CompareOp, Expr, ExprKind, FunctionDef, Program, Stmt, StmtKind,
    },
    symbol::{Symbol, SymbolTable, UserFunction, VarKind},
};

/// Estado del recorrido de emisión.
pub struct Generator<'a> {
    symbols: &'a mut SymbolTable,
    options: &'a Options,
    out: Vec<Emitted>,
    /// Pila de espacios de nombres para el mangling de locales.
    namespace: Vec<String>,
    /// Pila de etiquetas de fin de lazo, para `break`.
    loops: Vec<String>,
    /// Símbolo que el registro W contiene en este punto, si se sabe.
    w_tag: Option<String>,
    /// Aristas del grafo estático de llamadas.
    edges: Vec<(String, String)>,
    current_function: Option<u32>,
    returns: bool,
    /// Variables de módulo creadas por primera asignación.
    pub module_vars: Vec<String>,
}

impl<'a> Generator<'a> {
    pub fn new(symbols: &'a mut SymbolTable, options: &'a Options) -> Self {
        Generator {
            symbols,
            options,
            out: Vec::new(),
            namespace: Vec::new(),
            loops: Vec::new(),
            w_tag: None,
            edges: Vec::new(),
            current_function: None,
            returns: false,
            module_vars: Vec::new(),
        }
    }

    /// Emite el programa completo: cuerpo principal, `END`, cuerpos de
    /// funciones no inline y el `END` final.
    pub fn run(mut self, program: &Program) -> Compile<(Vec<Line>, Vec<String>)> {
        self.walk_block(&program.body)?;
        self.check_recursion()?;

        let last_line = program.body.last().map(|stmt| stmt.line).unwrap_or(1);

        let main = mem::take(&mut self.out);
        let mut lines = self.resolve(main)?;
        lines.push(Line::new("END", last_line));

        // Las funciones no inline se vuelcan después del END principal,
        // cada una entre su etiqueta de inicio y un JMPPOP
        let inline_all = self.options.flags.contains(Flags::INLINE_ALL_FUNCTIONS);
        let names: Vec<String> = self.symbols.function_names().to_vec();
        for name in names {
            let function = match self.symbols.get_function(&name) {
                Some(function) => function.clone(),
                None => continue,
            };

            if function.inline || inline_all {
                continue;
            }

            let body = self.resolve(function.body.clone())?;
            lines.push(Line::labeled(
                format!("begin_function_{}_label_0", name),
                "NOP",
                function.line,
            ));
            lines.extend(body);
            lines.push(Line::new("JMPPOP", function.line));
        }

        lines.push(Line::new("END", last_line));

        debug!("emitted {} assembly lines", lines.len());
        Ok((lines, self.module_vars))
    }

    fn walk_block(&mut self, statements: &[Stmt]) -> Compile<()> {
        for statement in statements {
            self.walk_stmt(statement)?;
        }

        Ok(())
    }

    fn walk_stmt(&mut self, statement: &Stmt) -> Compile<()> {
        let line = statement.line;

        match &statement.kind {
            StmtKind::Assign { target, value } => {
                self.eval(value)?;
                let target = self.resolve_write_target(target, line)?;
                self.push(Line::new(format!("STWR {}", target), line));
            }

            StmtKind::AugAssign { target, op, value } => {
                self.aug_assign(target, *op, value, line)?;
            }

            StmtKind::Call(call) => self.emit_call(call, false)?,

            StmtKind::If { test, body, orelse } => {
                let number = self.symbols.labels.next_if();
                let begin = format!("begin_if_label_{}", number);
                let end = format!("end_if_label_{}", number);

                self.label(&begin, line);

                let false_target = if orelse.is_empty() {
                    end.clone()
                } else {
                    format!("else_label_{}", self.symbols.labels.next_else())
                };

                self.compile_test(test, &false_target, None)?;
                self.walk_block(body)?;

                if !orelse.is_empty() {
                    self.push(Line::new(format!("JMP {}", end), line));
                    self.label(&false_target, line);
                    self.walk_block(orelse)?;
                }

                self.label(&end, line);
            }

            StmtKind::While { test, body } => {
                let number = self.symbols.labels.next_while();
                let begin = format!("begin_while_label_{}", number);
                let body_label = format!("begin_body_while_label_{}", number);
                let end = format!("end_while_label_{}", number);

                self.label(&begin, line);
                self.compile_test(test, &end, Some(&body_label))?;
                self.label(&body_label, line);

                self.loops.push(end.clone());
                let walked = self.walk_block(body);
                self.loops.pop();
                walked?;

                self.push(Line::new(format!("JMP {}", begin), line));
                self.label(&end, line);
            }

            StmtKind::Break => match self.loops.last().cloned() {
                Some(end) => self.push(Line::new(format!("JMP {}", end), line)),
                None => {
                    return Err(CompileError::Syntax {
                        line,
                        what: String::from("`break` outside of a loop"),
                    })
                }
            },

            StmtKind::Pass => (),

            StmtKind::Return { value } => {
                let index = self.current_function.ok_or_else(|| CompileError::Syntax {
                    line,
                    what: String::from("`return` outside of a function"),
                })?;

                if let Some(value) = value {
                    self.eval(value)?;
                    self.returns = true;
                }

                self.push(Line::new(format!("JMP end_function_label_{}", index), line));
            }

            StmtKind::FunctionDef(def) => self.function_def(def)?,
        }

        Ok(())
    }

    fn aug_assign(
        &mut self,
        target: &str,
        op: BinaryOp,
        value: &Expr,
        line: u32,
    ) -> Compile<()> {
        let target = self.resolve_name(target);
        match self.symbols.resolve(&target) {
            Some(Symbol::Var(_)) => (),
            Some(_) => {
                return Err(CompileError::TypeMismatch {
                    line,
                    name: target,
                    expected: "variable",
                })
            }
            None => return Err(CompileError::Undeclared { line, name: target }),
        }

        if let ExprKind::Int(literal) = value.kind {
            // Casos especiales sobre literales
            match op {
                BinaryOp::Add if literal == 1 => {
                    self.push(Line::new(format!("INC {}", target), line));
                    return Ok(());
                }

                BinaryOp::Sub if literal == 1 => {
                    self.push(Line::new(format!("DEC {}", target), line));
                    return Ok(());
                }

                BinaryOp::Mul | BinaryOp::Div if literal.is_power_of_two() => {
                    let shift = self.symbols.intern_inline(literal.trailing_zeros() as u64);
                    let opcode = if op == BinaryOp::Mul { "SHL" } else { "SHR" };

                    self.load(&target, line);
                    self.push(Line::new(format!("{} {}", opcode, shift), line));
                    self.push(Line::new(format!("STWR {}", target), line));
                    return Ok(());
                }

                _ => (),
            }
        }

        let operand = self.simple_operand(value)?;
        self.load(&target, line);
        self.push(Line::new(format!("{} {}", binary_opcode(op), operand), line));
        self.push(Line::new(format!("STWR {}", target), line));

        Ok(())
    }

    /// Evalúa una expresión dejando su resultado en W.
    fn eval(&mut self, expr: &Expr) -> Compile<()> {
        match &expr.kind {
            ExprKind::Int(value) => {
                let interned = self.symbols.intern_inline(*value);
                self.load(&interned, expr.line);
            }

            ExprKind::Name(name) => {
                let operand = self.read_operand(name, expr.line)?;
                self.load(&operand, expr.line);
            }

            ExprKind::Binary { left, op, right } => {
                // Multiplicación o división por potencia de dos
                if let ExprKind::Int(literal) = right.kind {
                    if matches!(op, BinaryOp::Mul | BinaryOp::Div) && literal.is_power_of_two() {
                        self.eval(left)?;

                        let shift =
                            self.symbols.intern_inline(literal.trailing_zeros() as u64);
                        let opcode = if *op == BinaryOp::Mul { "SHL" } else { "SHR" };
                        self.push(Line::new(format!("{} {}", opcode, shift), expr.line));

                        return Ok(());
                    }
                }

                self.eval(left)?;
                let operand = self.simple_operand(right)?;
                self.push(Line::new(
                    format!("{} {}", binary_opcode(*op), operand),
                    expr.line,
                ));
            }

            ExprKind::Call(call) => self.emit_call(call, true)?,

            ExprKind::Compare { .. } | ExprKind::BoolOp { .. } | ExprKind::Not(_) => {
                return Err(CompileError::Syntax {
                    line: expr.line,
                    what: String::from("comparison outside of a test position"),
                })
            }
        }

        Ok(())
    }

    /// Emite una llamada; `wants_value` exige que deje un valor en W.
    fn emit_call(&mut self, call: &Call, wants_value: bool) -> Compile<()> {
        if builtins::is_builtin(&call.name) {
            let args = call
                .args
                .iter()
                .map(|arg| self.call_arg(arg))
                .collect::<Compile<Vec<Arg>>>()?;

            let kwargs = call
                .kwargs
                .iter()
                .map(|(keyword, arg)| Ok((keyword.clone(), self.call_arg(arg)?)))
                .collect::<Compile<Vec<(String, Arg)>>>()?;

            match builtins::emit(&call.name, self.symbols, &args, &kwargs, call.line)? {
                Effect::Lines(lines) => {
                    for line in lines {
                        self.push(line);
                    }
                }

                Effect::Query { .. } => {
                    return Err(CompileError::Syntax {
                        line: call.line,
                        what: format!("query builtin `{}` outside of a test", call.name),
                    })
                }
            }

            return Ok(());
        }

        if let Some(assembly) = self.symbols.get_assembly(&call.name).cloned() {
            if !call.kwargs.is_empty() || call.args.len() != assembly.params.len() {
                return Err(CompileError::Syntax {
                    line: call.line,
                    what: format!(
                        "`{}` takes exactly {} positional arguments",
                        call.name,
                        assembly.params.len(),
                    ),
                });
            }

            let operands = call
                .args
                .iter()
                .map(|arg| self.call_operand(arg))
                .collect::<Compile<Vec<String>>>()?;

            // El cuerpo crudo se copia sustituyendo los parámetros por
            // los operandos del llamador
            for raw in &assembly.body {
                let mut line = split_raw_line(raw, call.line);
                for (param, operand) in assembly.params.iter().zip(&operands) {
                    line.replace_operand(param, operand);
                }

                self.push(line);
            }

            return Ok(());
        }

        // Función de usuario, posiblemente aún no definida
        let caller = self.namespace.last().cloned().unwrap_or_default();
        self.edges.push((caller, call.name.clone()));

        let args = call
            .args
            .iter()
            .map(|arg| self.call_operand(arg))
            .collect::<Compile<Vec<String>>>()?;

        let kwargs = call
            .kwargs
            .iter()
            .map(|(keyword, arg)| Ok((keyword.clone(), self.call_operand(arg)?)))
            .collect::<Compile<Vec<(String, String)>>>()?;

        self.push_thunk(CallSite {
            name: call.name.clone(),
            args,
            kwargs,
            line: call.line,
            wants_value,
        });

        Ok(())
    }

    fn function_def(&mut self, def: &FunctionDef) -> Compile<()> {
        self.symbols.check_available(&def.name, def.line)?;

        let index = self.symbols.labels.next_function();

        let defaults: HashMap<&str, u64> = def
            .defaults
            .iter()
            .map(|(name, value)| (name.as_str(), *value))
            .collect();

        for param in &def.params {
            let mangled = format!("{}_{}", def.name, param);
            let value = defaults.get(param.as_str()).copied().unwrap_or(0);
            self.symbols
                .add_var(&mangled, VarKind::Plain, value, None, None, def.line)?;
        }

        // El cuerpo se emite a un buffer propio; el estado W no
        // sobrevive la frontera de la definición
        let saved_out = mem::take(&mut self.out);
        let saved_w = self.w_tag.take();
        let saved_returns = mem::replace(&mut self.returns, false);
        let saved_function = self.current_function.replace(index);

        self.namespace.push(def.name.clone());
        let walked = self.walk_block(&def.body);
        self.namespace.pop();

        let returns = mem::replace(&mut self.returns, saved_returns);
        let mut body = mem::replace(&mut self.out, saved_out);
        self.w_tag = saved_w;
        self.current_function = saved_function;

        walked?;

        body.push(Emitted::Op(Line::labeled(
            format!("end_function_label_{}", index),
            "NOP",
            def.line,
        )));

        // Parámetros que el cuerpo nunca escribe
        let byref = def
            .params
            .iter()
            .filter(|param| !writes_to(&body, &format!("{}_{}", def.name, param)))
            .cloned()
            .collect();

        self.symbols.add_function(UserFunction {
            name: def.name.clone(),
            params: def.params.clone(),
            defaults: def.defaults.clone(),
            inline: def.inline,
            returns,
            byref,
            index,
            body,
            line: def.line,
        });

        Ok(())
    }

    // ------------------------------------------------------------------
    // Condiciones

    /// Emite el código de prueba de un `if` o `while`.
    ///
    /// El flujo cae al cuerpo cuando la condición es verdadera y salta
    /// a `false_target` cuando no. Los grupos `or` saltan directo a
    /// `true_target` si se provee; de lo contrario se sintetiza una
    /// etiqueta `or_label_N` que queda justo antes del cuerpo.
    fn compile_test(
        &mut self,
        test: &Expr,
        false_target: &str,
        true_target: Option<&str>,
    ) -> Compile<()> {
        let terms = self.flatten(test)?;

        let mut groups: Vec<Vec<Term>> = vec![Vec::new()];
        for term in terms {
            let or_link = term.or_link;
            groups.last_mut().unwrap().push(term);
            if or_link {
                groups.push(Vec::new());
            }
        }

        if groups.len() == 1 {
            for term in &groups[0] {
                self.emit_term(term, false, false_target)?;
            }

            return Ok(());
        }

        let (true_label, synthesized) = match true_target {
            Some(label) => (label.to_string(), false),
            None => (
                format!("or_label_{}", self.symbols.labels.next_or()),
                true,
            ),
        };

        let last = groups.len() - 1;
        for group in &groups[..last] {
            match group.split_last() {
                Some((tail, [])) => self.emit_term(tail, true, &true_label)?,

                Some((tail, head)) => {
                    // Un grupo `and` interno falla hacia su propia
                    // etiqueta de salto corto
                    let skip = format!("or_label_{}", self.symbols.labels.next_or());
                    for term in head {
                        self.emit_term(term, false, &skip)?;
                    }

                    self.emit_term(tail, true, &true_label)?;
                    self.label(&skip, test.line);
                }

                None => (),
            }
        }

        for term in &groups[last] {
            self.emit_term(term, false, false_target)?;
        }

        if synthesized {
            self.label(&true_label, test.line);
        }

        Ok(())
    }

    /// Aplana una prueba al modelo de lista de términos con enlaces or.
    fn flatten(&mut self, test: &Expr) -> Compile<Vec<Term>> {
        match &test.kind {
            ExprKind::BoolOp {
                op: BoolOp::Or,
                values,
            } => {
                let mut terms = Vec::new();
                for (index, value) in values.iter().enumerate() {
                    let mut group = self.flatten_group(value)?;
                    if index + 1 < values.len() {
                        if let Some(last) = group.last_mut() {
                            last.or_link = true;
                        }
                    }

                    terms.extend(group);
                }

                Ok(terms)
            }

            _ => self.flatten_group(test),
        }
    }

    fn flatten_group(&mut self, expr: &Expr) -> Compile<Vec<Term>> {
        match &expr.kind {
            ExprKind::BoolOp {
                op: BoolOp::And,
                values,
            } => {
                let mut group = Vec::new();
                for value in values {
                    group.extend(self.flatten_atom(value, false)?);
                }

                Ok(group)
            }

            _ => self.flatten_atom(expr, false),
        }
    }

    fn flatten_atom(&mut self, expr: &Expr, negate: bool) -> Compile<Vec<Term>> {
        match &expr.kind {
            ExprKind::Not(inner) => self.flatten_atom(inner, !negate),

            ExprKind::BoolOp { .. } => Err(CompileError::Syntax {
                line: expr.line,
                what: String::from("nested boolean groups are not supported"),
            }),

            ExprKind::Compare { left, comparisons } => {
                if comparisons.len() == 1 {
                    let (op, right) = &comparisons[0];
                    return Ok(vec![Term {
                        negate,
                        or_link: false,
                        line: expr.line,
                        atom: Atom::Compare {
                            left: (**left).clone(),
                            op: *op,
                            right: right.clone(),
                        },
                    }]);
                }

                if negate {
                    return Err(CompileError::Syntax {
                        line: expr.line,
                        what: String::from("cannot negate a comparison chain"),
                    });
                }

                // `a OP1 b OP2 c` equivale a la conjunción por pares
                let mut terms = Vec::new();
                let mut left = (**left).clone();
                for (op, right) in comparisons {
                    terms.push(Term {
                        negate: false,
                        or_link: false,
                        line: expr.line,
                        atom: Atom::Compare {
                            left,
                            op: *op,
                            right: right.clone(),
                        },
                    });

                    left = right.clone();
                }

                Ok(terms)
            }

            ExprKind::Call(call) if builtins::QUERIES.contains(&call.name.as_str()) => {
                let (on_true, on_false) = match builtins::emit(
                    &call.name,
                    self.symbols,
                    &[],
                    &[],
                    call.line,
                )? {
                    Effect::Query { on_true, on_false } => (on_true, on_false),
                    Effect::Lines(_) => unreachable!(),
                };

                if !call.args.is_empty() || !call.kwargs.is_empty() {
                    return Err(CompileError::Syntax {
                        line: call.line,
                        what: format!("`{}` takes no arguments", call.name),
                    });
                }

                Ok(vec![Term {
                    negate,
                    or_link: false,
                    line: expr.line,
                    atom: Atom::Query { on_true, on_false },
                }])
            }

            _ => Ok(vec![Term {
                negate,
                or_link: false,
                line: expr.line,
                atom: Atom::Value(expr.clone()),
            }]),
        }
    }

    /// Emite un término: salta a `target` cuando el término vale
    /// `jump_if`, y cae al siguiente en caso contrario.
    fn emit_term(&mut self, term: &Term, jump_if: bool, target: &str) -> Compile<()> {
        let polarity = jump_if != term.negate;

        match &term.atom {
            Atom::Compare { left, op, right } => {
                self.eval(left)?;
                let operand = self.simple_operand(right)?;
                self.push(Line::new(
                    format!("{} {}", compare_opcode(*op), operand),
                    term.line,
                ));

                let jump = if polarity { "JMPCMP" } else { "JMPNCMP" };
                self.push(Line::new(format!("{} {}", jump, target), term.line));
            }

            Atom::Query { on_true, on_false } => {
                let opcode = if polarity { on_true } else { on_false };
                self.push(Line::new(format!("{} {}", opcode, target), term.line));
            }

            Atom::Value(expr) => {
                // La veracidad de un valor es `> 0` en palabras sin signo
                self.eval(expr)?;
                self.push(Line::new("CMPGREATER NULL", term.line));

                let jump = if polarity { "JMPCMP" } else { "JMPNCMP" };
                self.push(Line::new(format!("{} {}", jump, target), term.line));
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Resolución de llamadas

    /// Reemplaza los marcadores de llamada hasta el punto fijo.
    fn resolve(&mut self, mut work: Vec<Emitted>) -> Compile<Vec<Line>> {
        while work.iter().any(|e| matches!(e, Emitted::Call(_))) {
            let mut next = Vec::with_capacity(work.len());
            for element in work {
                match element {
                    Emitted::Op(line) => next.push(Emitted::Op(line)),
                    Emitted::Call(site) => next.extend(self.expand(site)?),
                }
            }

            work = next;
        }

        Ok(work
            .into_iter()
            .map(|element| match element {
                Emitted::Op(line) => line,
                Emitted::Call(_) => unreachable!(),
            })
            .collect())
    }

    /// Expande un sitio de llamada a función de usuario.
    fn expand(&mut self, site: CallSite) -> Compile<Vec<Emitted>> {
        let function = match self.symbols.get_function(&site.name) {
            Some(function) => function.clone(),
            None => {
                return Err(CompileError::UnresolvedCall {
                    line: site.line,
                    name: site.name,
                })
            }
        };

        if site.wants_value && !function.returns {
            return Err(CompileError::MissingReturn {
                line: site.line,
                name: site.name,
            });
        }

        if site.args.len() > function.params.len() {
            return Err(CompileError::Syntax {
                line: site.line,
                what: format!("too many arguments in call to `{}`", site.name),
            });
        }

        for (keyword, _) in &site.kwargs {
            match function.params.iter().position(|param| param == keyword) {
                None => {
                    return Err(CompileError::Syntax {
                        line: site.line,
                        what: format!(
                            "unknown keyword argument `{}` in call to `{}`",
                            keyword, site.name,
                        ),
                    })
                }

                Some(position) if position < site.args.len() => {
                    return Err(CompileError::Syntax {
                        line: site.line,
                        what: format!("duplicate argument `{}`", keyword),
                    })
                }

                Some(_) => (),
            }
        }

        // Enlace de parámetros a operandos suministrados
        let bound: Vec<(String, Option<String>)> = function
            .params
            .iter()
            .enumerate()
            .map(|(position, param)| {
                let supplied = site.args.get(position).cloned().or_else(|| {
                    site.kwargs
                        .iter()
                        .find(|(keyword, _)| keyword == param)
                        .map(|(_, operand)| operand.clone())
                });

                (param.clone(), supplied)
            })
            .collect();

        let inline = function.inline || self.options.flags.contains(Flags::INLINE_ALL_FUNCTIONS);
        let safe_byref = self.options.flags.contains(Flags::SAFE_PASS_BY_REFERENCE);

        let mut out = Vec::new();

        if inline {
            let mut body = self.relabel(&function.body);

            for (param, supplied) in &bound {
                let operand = match supplied {
                    Some(operand) => operand,
                    None => continue,
                };

                let mangled = format!("{}_{}", function.name, param);
                if safe_byref && function.byref.contains(param) {
                    substitute(&mut body, &mangled, operand);
                } else {
                    out.push(Emitted::Op(Line::new(format!("LDWR {}", operand), site.line)));
                    out.push(Emitted::Op(Line::new(format!("STWR {}", mangled), site.line)));
                }
            }

            out.extend(body);
        } else {
            for (param, supplied) in &bound {
                let operand = match supplied {
                    Some(operand) => operand,
                    None => continue,
                };

                let mangled = format!("{}_{}", function.name, param);
                out.push(Emitted::Op(Line::new(format!("LDWR {}", operand), site.line)));
                out.push(Emitted::Op(Line::new(format!("STWR {}", mangled), site.line)));
            }

            out.push(Emitted::Op(Line::new(
                format!("JMPPUSH begin_function_{}_label_0", site.name),
                site.line,
            )));
        }

        Ok(out)
    }

    /// Copia un cuerpo renombrando sus etiquetas internas a números
    /// frescos, para que cada empalme inline sea único.
    fn relabel(&mut self, body: &[Emitted]) -> Vec<Emitted> {
        let mut assigned: HashMap<(String, String), u32> = HashMap::new();
        let mut rename: HashMap<String, String> = HashMap::new();

        for element in body {
            let label = match element {
                Emitted::Op(line) => match &line.label {
                    Some(label) => label,
                    None => continue,
                },
                Emitted::Call(_) => continue,
            };

            if let Some((prefix, number)) = split_label(label) {
                let family = family_of(&prefix);
                let key = (family.clone(), number);

                if !assigned.contains_key(&key) {
                    let fresh = self.alloc_family_number(&family);
                    assigned.insert(key.clone(), fresh);
                }

                rename.insert(label.clone(), format!("{}{}", prefix, assigned[&key]));
            }
        }

        body.iter()
            .map(|element| match element {
                Emitted::Op(line) => {
                    let mut line = line.clone();
                    if let Some(label) = &line.label {
                        if let Some(new) = rename.get(label) {
                            line.label = Some(new.clone());
                        }
                    }

                    let retarget = line
                        .jump_target()
                        .and_then(|target| rename.get(target))
                        .cloned();
                    if let Some(new) = retarget {
                        line.set_jump_target(&new);
                    }

                    Emitted::Op(line)
                }

                Emitted::Call(site) => Emitted::Call(site.clone()),
            })
            .collect()
    }

    fn alloc_family_number(&mut self, family: &str) -> u32 {
        match family {
            "if" => self.symbols.labels.next_if(),
            "else" => self.symbols.labels.next_else(),
            "while" => self.symbols.labels.next_while(),
            "function" => self.symbols.labels.next_function(),
            _ => self.symbols.labels.next_or(),
        }
    }

    // ------------------------------------------------------------------
    // Recursión

    fn check_recursion(&self) -> Compile<()> {
        let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
        for (caller, callee) in &self.edges {
            if !caller.is_empty() {
                graph.entry(caller).or_default().push(callee);
            }
        }

        let mut done: HashSet<&str> = HashSet::new();
        let starts: Vec<&str> = graph.keys().copied().collect();
        for start in starts {
            if done.contains(start) {
                continue;
            }

            let mut path: Vec<&str> = Vec::new();
            self.trace(start, &graph, &mut path, &mut done)?;
        }

        Ok(())
    }

    fn trace<'g>(
        &self,
        node: &'g str,
        graph: &HashMap<&'g str, Vec<&'g str>>,
        path: &mut Vec<&'g str>,
        done: &mut HashSet<&'g str>,
    ) -> Compile<()> {
        if let Some(position) = path.iter().position(|seen| *seen == node) {
            let mut names: Vec<String> =
                path[position..].iter().map(|name| name.to_string()).collect();
            names.push(node.to_string());

            return Err(CompileError::Recursion { names });
        }

        if done.contains(node) {
            return Ok(());
        }

        path.push(node);
        if let Some(callees) = graph.get(node) {
            for callee in callees.clone() {
                self.trace(callee, graph, path, done)?;
            }
        }
        path.pop();

        done.insert(node);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Auxiliares de nombres y emisión

    /// Resuelve un nombre a través de la pila de espacios de nombres.
    fn resolve_name(&self, name: &str) -> String {
        for namespace in self.namespace.iter().rev() {
            let mangled = format!("{}_{}", namespace, name);
            if self.symbols.resolve(&mangled).is_some() {
                return mangled;
            }
        }

        if self.symbols.resolve(name).is_some() {
            return name.to_string();
        }

        match self.namespace.last() {
            Some(namespace) => format!("{}_{}", namespace, name),
            None => name.to_string(),
        }
    }

    /// Resuelve el destino de una asignación, declarándolo si es nuevo.
    fn resolve_write_target(&mut self, name: &str, line: u32) -> Compile<String> {
        let resolved = self.resolve_name(name);

        match self.symbols.resolve(&resolved) {
            Some(Symbol::Var(_)) => Ok(resolved),

            Some(_) => Err(CompileError::TypeMismatch {
                line,
                name: resolved,
                expected: "variable",
            }),

            None => {
                self.symbols
                    .add_var(&resolved, VarKind::Plain, 0, None, None, line)?;

                if self.namespace.is_empty() {
                    self.module_vars.push(resolved.clone());
                }

                Ok(resolved)
            }
        }
    }

    /// Resuelve un nombre leído; debe existir como variable o constante.
    fn read_operand(&self, name: &str, line: u32) -> Compile<String> {
        let resolved = self.resolve_name(name);

        match self.symbols.resolve(&resolved) {
            Some(Symbol::Var(_)) | Some(Symbol::Const(_)) => Ok(resolved),

            Some(_) => Err(CompileError::TypeMismatch {
                line,
                name: resolved,
                expected: "variable",
            }),

            None => Err(CompileError::Undeclared {
                line,
                name: resolved,
            }),
        }
    }

    /// Operando simple: un nombre o un literal internado.
    fn simple_operand(&mut self, expr: &Expr) -> Compile<String> {
        match &expr.kind {
            ExprKind::Int(value) => Ok(self.symbols.intern_inline(*value)),
            ExprKind::Name(name) => self.read_operand(name, expr.line),

            _ => Err(CompileError::Syntax {
                line: expr.line,
                what: String::from(
                    "operand too complex for the single-accumulator target",
                ),
            }),
        }
    }

    /// Argumento de primitiva: nombre resuelto o literal.
    fn call_arg(&self, expr: &Expr) -> Compile<Arg> {
        match &expr.kind {
            ExprKind::Int(value) => Ok(Arg::Literal(*value)),
            ExprKind::Name(name) => Ok(Arg::Name(self.resolve_name(name))),

            _ => Err(CompileError::Syntax {
                line: expr.line,
                what: String::from("argument must be a name or a literal"),
            }),
        }
    }

    /// Argumento de función de usuario, resuelto a nombre de símbolo.
    fn call_operand(&mut self, expr: &Expr) -> Compile<String> {
        self.simple_operand(expr)
    }

    fn push(&mut self, line: Line) {
        self.w_tag = match line.opcode() {
            "LDWR" | "STWR" | "INC" | "DEC" => {
                line.operands().first().map(|operand| operand.to_string())
            }
            _ => None,
        };

        self.out.push(Emitted::Op(line));
    }

    fn push_thunk(&mut self, site: CallSite) {
        self.w_tag = None;
        self.out.push(Emitted::Call(site));
    }

    fn label(&mut self, name: &str, line: u32) {
        self.push(Line::labeled(name, "NOP", line));
    }

    fn load(&mut self, operand: &str, line: u32) {
        if self.w_tag.as_deref() != Some(operand) {
            self.push(Line::new(format!("LDWR {}", operand), line));
        }
    }
}

/// Un término del modelo de condiciones aplanado.
struct Term {
    negate: bool,
    or_link: bool,
    line: u32,
    atom: Atom,
}

enum Atom {
    Compare {
        left: Expr,
        op: CompareOp,
        right: Expr,
    },

    Query {
        on_true: &'static str,
        on_false: &'static str,
    },

    Value(Expr),
}

fn binary_opcode(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "ADDW",
        BinaryOp::Sub => "SUBW",
        BinaryOp::Mul => "MULTW",
        BinaryOp::Div => "DIVW",
        BinaryOp::Shl => "SHL",
        BinaryOp::Shr => "SHR",
        BinaryOp::BitAnd => "ANDW",
        BinaryOp::BitOr => "ORW",
    }
}

fn compare_opcode(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Less => "CMPLESS",
        CompareOp::LessEq => "CMPLE",
        CompareOp::Greater => "CMPGREATER",
        CompareOp::GreaterEq => "CMPGE",
        CompareOp::Equal => "CMPEQUAL",
        CompareOp::NotEqual => "CMPNOTEQUAL",
    }
}

/// Determina si un cuerpo escribe sobre un símbolo.
fn writes_to(body: &[Emitted], name: &str) -> bool {
    body.iter().any(|element| match element {
        Emitted::Op(line) => {
            matches!(line.opcode(), "STWR" | "INC" | "DEC")
                && line.operands().first() == Some(&name)
        }
        Emitted::Call(_) => false,
    })
}

/// Sustituye un operando por otro en todo un cuerpo, incluyendo los
/// sitios de llamada pendientes.
fn substitute(body: &mut [Emitted], from: &str, to: &str) {
    for element in body {
        match element {
            Emitted::Op(line) => line.replace_operand(from, to),

            Emitted::Call(site) => {
                for arg in &mut site.args {
                    if arg == from {
                        *arg = to.to_string();
                    }
                }

                for (_, arg) in &mut site.kwargs {
                    if arg == from {
                        *arg = to.to_string();
                    }
                }
            }
        }
    }
}

/// Parte una línea cruda de ensamblador en etiqueta opcional y código.
fn split_raw_line(raw: &str, line: u32) -> Line {
    let trimmed = raw.trim();

    if let Some(colon) = trimmed.find(':') {
        let (label, rest) = trimmed.split_at(colon);
        let is_label = !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');

        if is_label {
            let code = rest[1..].trim();
            let code = if code.is_empty() { "NOP" } else { code };
            return Line::labeled(label, code, line);
        }
    }

    Line::new(trimmed, line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_label_names() {
        assert_eq!(
            split_label("begin_while_label_3"),
            Some((String::from("begin_while_label_"), String::from("3"))),
        );
        assert_eq!(split_label("begin_while_label_x"), None);
        assert_eq!(split_label("NOP"), None);
    }

    #[test]
    fn label_families_pair_begin_and_end() {
        assert_eq!(family_of("begin_if_label_"), "if");
        assert_eq!(family_of("end_if_label_"), "if");
        assert_eq!(family_of("begin_body_while_label_"), "while");
        assert_eq!(family_of("apply_scan_label_"), "apply_scan_label_");
    }

    #[test]
    fn raw_assembly_lines_keep_their_labels() {
        let line = split_raw_line("loop_0: DACOUT ch, v", 4);
        assert_eq!(line.label.as_deref(), Some("loop_0"));
        assert_eq!(line.code, "DACOUT ch, v");

        let line = split_raw_line("NOP", 4);
        assert_eq!(line.label, None);
        assert_eq!(line.code, "NOP");
    }

    #[test]
    fn write_detection_covers_inc_and_dec() {
        let body = vec![
            Emitted::Op(Line::new("LDWR f_x", 1)),
            Emitted::Op(Line::new("INC f_y", 1)),
        ];

        assert!(!writes_to(&body, "f_x"));
        assert!(writes_to(&body, "f_y"));
    }
}
