//! Modelo de símbolos.
//!
//! Un espacio de nombres plano es dueño de todo identificador que el
//! programa menciona o que el emisor sintetiza. Cada nombre resuelve a
//! una variante etiquetada: constante, variable (con tipo de dominio,
//! codificación, unidad y valor inicial opcionales), primitiva
//! integrada, función de usuario o función de ensamblador literal.
//! La tabla también administra los contadores monotónicos con los que
//! se numeran las etiquetas sintetizadas.

use std::collections::HashMap;
use std::fmt::{self, Display};

use crate::{
    asm::Emitted,
    builtins,
    error::{Compile, CompileError},
};

/// Valor del tick de reloj del procesador objetivo, en nanosegundos.
pub const CLOCK_TICK_NS: f64 = 5.0;

/// Tipo de dominio de una variable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VarKind {
    Plain,
    Parameter,
    Shutter,
    MaskedShutter,
    Trigger,
    Counter,
    Exitcode,
    Address,
}

impl Display for VarKind {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            VarKind::Plain => "",
            VarKind::Parameter => "parameter",
            VarKind::Shutter => "shutter",
            VarKind::MaskedShutter => "masked_shutter",
            VarKind::Trigger => "trigger",
            VarKind::Counter => "counter",
            VarKind::Exitcode => "exitcode",
            VarKind::Address => "address",
        };

        fmt.write_str(string)
    }
}

/// Una constante declarada o predefinida.
#[derive(Debug, Clone)]
pub struct Constant {
    pub name: String,
    pub value: u64,
}

/// Una variable declarada, implícita o sintetizada.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub value: u64,
    pub kind: VarKind,
    pub encoding: Option<String>,
    pub unit: Option<String>,
    /// Cierto para los parámetros inline sintetizados por el emisor.
    pub interned: bool,
}

/// Una función de usuario con su cuerpo ya emitido.
#[derive(Debug, Clone)]
pub struct UserFunction {
    pub name: String,
    pub params: Vec<String>,
    pub defaults: Vec<(String, u64)>,
    pub inline: bool,
    /// Cierto si alguna ruta `return` produce un valor.
    pub returns: bool,
    /// Parámetros que el cuerpo nunca escribe; candidatos a paso por
    /// referencia en los sitios de llamada inline.
    pub byref: Vec<String>,
    /// Número de función, parte de `end_function_label_N`.
    pub index: u32,
    pub body: Vec<Emitted>,
    pub line: u32,
}

/// Una función de ensamblador literal.
#[derive(Debug, Clone)]
pub struct AssemblyFunction {
    pub name: String,
    pub params: Vec<String>,
    /// Cuerpo crudo, una instrucción por línea.
    pub body: Vec<String>,
    pub line: u32,
}

/// Variante etiquetada de un símbolo.
#[derive(Debug, Clone)]
pub enum Symbol {
    Const(Constant),
    Var(Variable),
    Builtin(&'static str),
    Function(UserFunction),
    Assembly(AssemblyFunction),
}

/// Contadores monotónicos para numerar etiquetas sintetizadas.
///
/// Cada familia de constructos lleva el suyo. Las familias de bloque
/// comienzan en 1; el contador de funciones comienza en 0 porque la
/// etiqueta de inicio de toda función lleva el sufijo fijo `_label_0`.
#[derive(Debug, Default)]
pub struct LabelCounters {
    ifs: u32,
    elses: u32,
    whiles: u32,
    ors: u32,
    functions: u32,
}

impl LabelCounters {
    pub fn next_if(&mut self) -> u32 {
        self.ifs += 1;
        self.ifs
    }

    pub fn next_else(&mut self) -> u32 {
        self.elses += 1;
        self.elses
    }

    pub fn next_while(&mut self) -> u32 {
        self.whiles += 1;
        self.whiles
    }

    pub fn next_or(&mut self) -> u32 {
        self.ors += 1;
        self.ors
    }

    pub fn next_function(&mut self) -> u32 {
        let index = self.functions;
        self.functions += 1;
        index
    }
}

/// La tabla de símbolos de una compilación.
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
    /// Orden de inserción de constantes y variables, para el encabezado.
    order: Vec<String>,
    /// Orden de definición de funciones, para el volcado final.
    functions: Vec<String>,
    pub labels: LabelCounters,
}

impl SymbolTable {
    /// Crea una tabla poblada con las constantes y primitivas fijas.
    pub fn new() -> Self {
        let mut table = SymbolTable {
            symbols: HashMap::new(),
            order: Vec::new(),
            functions: Vec::new(),
            labels: LabelCounters::default(),
        };

        // Población inicial: constantes del firmware y primitivas
        table.add_const("NULL", 0, 0).unwrap();
        table.add_const("FFFFFFFF", 0xffff_ffff_ffff_ffff, 0).unwrap();
        table
            .add_const("INTERRUPT_EXITCODE", 0xfffe_1000_0000_0000, 0)
            .unwrap();

        for &name in builtins::NAMES {
            table.symbols.insert(name.to_string(), Symbol::Builtin(name));
        }

        table
    }

    /// Verifica que un nombre no esté ocupado.
    pub fn check_available(&self, name: &str, line: u32) -> Compile<()> {
        if self.symbols.contains_key(name) {
            Err(CompileError::Redeclaration {
                line,
                name: name.to_string(),
            })
        } else {
            Ok(())
        }
    }

    pub fn add_const(&mut self, name: &str, value: u64, line: u32) -> Compile<()> {
        self.check_available(name, line)?;

        self.symbols.insert(
            name.to_string(),
            Symbol::Const(Constant {
                name: name.to_string(),
                value,
            }),
        );
        self.order.push(name.to_string());

        Ok(())
    }

    pub fn add_var(
        &mut self,
        name: &str,
        kind: VarKind,
        value: u64,
        encoding: Option<String>,
        unit: Option<String>,
        line: u32,
    ) -> Compile<()> {
        self.check_available(name, line)?;

        self.symbols.insert(
            name.to_string(),
            Symbol::Var(Variable {
                name: name.to_string(),
                value,
                kind,
                encoding,
                unit,
                interned: false,
            }),
        );
        self.order.push(name.to_string());

        Ok(())
    }

    /// Interna un literal entero como parámetro inline.
    ///
    /// Cada valor distinto produce exactamente una variable sintetizada
    /// `inlinevar_for_<valor>`; valores repetidos reusan la existente.
    pub fn intern_inline(&mut self, value: u64) -> String {
        let name = format!("inlinevar_for_{}", value);

        if !self.symbols.contains_key(&name) {
            self.symbols.insert(
                name.clone(),
                Symbol::Var(Variable {
                    name: name.clone(),
                    value,
                    kind: VarKind::Plain,
                    encoding: None,
                    unit: None,
                    interned: true,
                }),
            );
            self.order.push(name.clone());
        }

        name
    }

    /// Busca una variable, opcionalmente exigiendo tipos de dominio.
    pub fn get_var(
        &self,
        name: &str,
        required: Option<&[VarKind]>,
        line: u32,
    ) -> Compile<&Variable> {
        match self.symbols.get(name) {
            Some(Symbol::Var(var)) => match required {
                Some(kinds) if !kinds.contains(&var.kind) => Err(CompileError::TypeMismatch {
                    line,
                    name: name.to_string(),
                    expected: expected_kinds(kinds),
                }),
                _ => Ok(var),
            },

            Some(_) => Err(CompileError::TypeMismatch {
                line,
                name: name.to_string(),
                expected: "variable",
            }),

            None => Err(CompileError::Undeclared {
                line,
                name: name.to_string(),
            }),
        }
    }

    pub fn get_const(&self, name: &str, line: u32) -> Compile<&Constant> {
        match self.symbols.get(name) {
            Some(Symbol::Const(constant)) => Ok(constant),
            Some(_) => Err(CompileError::TypeMismatch {
                line,
                name: name.to_string(),
                expected: "constant",
            }),
            None => Err(CompileError::Undeclared {
                line,
                name: name.to_string(),
            }),
        }
    }

    /// Busca una función de usuario.
    pub fn get_function(&self, name: &str) -> Option<&UserFunction> {
        match self.symbols.get(name) {
            Some(Symbol::Function(function)) => Some(function),
            _ => None,
        }
    }

    pub fn get_function_mut(&mut self, name: &str) -> Option<&mut UserFunction> {
        match self.symbols.get_mut(name) {
            Some(Symbol::Function(function)) => Some(function),
            _ => None,
        }
    }

    pub fn get_assembly(&self, name: &str) -> Option<&AssemblyFunction> {
        match self.symbols.get(name) {
            Some(Symbol::Assembly(function)) => Some(function),
            _ => None,
        }
    }

    /// Registra una función de usuario ya emitida.
    pub fn add_function(&mut self, function: UserFunction) {
        self.functions.push(function.name.clone());
        self.symbols
            .insert(function.name.clone(), Symbol::Function(function));
    }

    /// Registra una función de ensamblador literal.
    pub fn add_assembly(&mut self, function: AssemblyFunction) -> Compile<()> {
        self.check_available(&function.name, function.line)?;
        self.symbols
            .insert(function.name.clone(), Symbol::Assembly(function));
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// Nombres de funciones de usuario en orden de definición.
    pub fn function_names(&self) -> &[String] {
        &self.functions
    }

    /// Constantes en orden de inserción.
    pub fn constants(&self) -> impl Iterator<Item = &Constant> {
        self.order.iter().filter_map(move |name| {
            match self.symbols.get(name) {
                Some(Symbol::Const(constant)) => Some(constant),
                _ => None,
            }
        })
    }

    /// Variables en orden de inserción.
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.order.iter().filter_map(move |name| {
            match self.symbols.get(name) {
                Some(Symbol::Var(var)) => Some(var),
                _ => None,
            }
        })
    }

    /// Convierte una magnitud con unidad a su valor de encabezado.
    ///
    /// Las unidades de tiempo se reducen a ciclos de reloj de 5 ns,
    /// redondeando; otras unidades dejan la magnitud intacta y
    /// sobreviven solo como etiqueta del encabezado.
    pub fn scale_magnitude(magnitude: f64, unit: &str) -> Option<u64> {
        let nanoseconds = match unit {
            "s" => magnitude * 1e9,
            "ms" => magnitude * 1e6,
            "us" => magnitude * 1e3,
            "ns" => magnitude,
            _ => return None,
        };

        Some((nanoseconds / CLOCK_TICK_NS).round() as u64)
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable::new()
    }
}

/// Descripción estática de los tipos exigidos, para los mensajes.
fn expected_kinds(kinds: &[VarKind]) -> &'static str {
    match kinds {
        [VarKind::Shutter, VarKind::MaskedShutter] => "shutter or masked_shutter variable",
        [VarKind::Trigger] => "trigger variable",
        [VarKind::Counter] => "counter variable",
        [VarKind::Exitcode] => "exitcode variable",
        _ => "variable of the required type",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepopulates_firmware_constants() {
        let table = SymbolTable::new();
        assert_eq!(table.get_const("NULL", 1).unwrap().value, 0);
        assert_eq!(table.get_const("FFFFFFFF", 1).unwrap().value, u64::MAX);
        assert_eq!(
            table.get_const("INTERRUPT_EXITCODE", 1).unwrap().value,
            0xfffe_1000_0000_0000,
        );
    }

    #[test]
    fn rejects_redeclaration() {
        let mut table = SymbolTable::new();
        table
            .add_var("x", VarKind::Plain, 0, None, None, 1)
            .unwrap();

        assert!(matches!(
            table.add_var("x", VarKind::Plain, 1, None, None, 2),
            Err(CompileError::Redeclaration { line: 2, .. }),
        ));
    }

    #[test]
    fn rejects_shadowing_a_builtin() {
        let mut table = SymbolTable::new();
        assert!(matches!(
            table.add_var("pulse", VarKind::Plain, 0, None, None, 3),
            Err(CompileError::Redeclaration { .. }),
        ));
    }

    #[test]
    fn interning_is_idempotent() {
        let mut table = SymbolTable::new();
        let first = table.intern_inline(10);
        let second = table.intern_inline(10);

        assert_eq!(first, "inlinevar_for_10");
        assert_eq!(first, second);
        assert_eq!(table.variables().filter(|v| v.interned).count(), 1);
    }

    #[test]
    fn typed_lookup_demands_kind() {
        let mut table = SymbolTable::new();
        table
            .add_var("gate", VarKind::Shutter, 0, None, None, 1)
            .unwrap();

        assert!(table
            .get_var("gate", Some(&[VarKind::Shutter, VarKind::MaskedShutter]), 1)
            .is_ok());
        assert!(matches!(
            table.get_var("gate", Some(&[VarKind::Trigger]), 7),
            Err(CompileError::TypeMismatch { line: 7, .. }),
        ));
    }

    #[test]
    fn time_units_scale_to_clock_cycles() {
        assert_eq!(SymbolTable::scale_magnitude(100.0, "us"), Some(20_000));
        assert_eq!(SymbolTable::scale_magnitude(1.0, "s"), Some(200_000_000));
        assert_eq!(SymbolTable::scale_magnitude(12.0, "ns"), Some(2));
        assert_eq!(SymbolTable::scale_magnitude(1.0, "xyz"), None);
    }

    #[test]
    fn label_counters_are_monotonic() {
        let mut counters = LabelCounters::default();
        assert_eq!(counters.next_while(), 1);
        assert_eq!(counters.next_while(), 2);
        assert_eq!(counters.next_function(), 0);
        assert_eq!(counters.next_function(), 1);
    }
}
