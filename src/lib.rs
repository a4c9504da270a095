//! Compilador de programas de pulsos (ppp) para el soft core del
//! pulser FPGA.
//!
//! # Front end
//! Cada programa deriva de un único archivo de código fuente. El
//! archivo pasa primero por el pre-procesador de declaraciones en
//! [`decl`], que consume pragmas, constantes, variables y funciones de
//! ensamblador literal poblando el modelo de símbolos de [`symbol`].
//! El resto se somete a análisis léxico en [`lex`] y sintáctico en
//! [`parse`], de lo cual se obtiene el árbol del programa.
//!
//! # Back end
//! El recorrido de emisión en [`codegen`] baja el árbol a líneas de
//! ensamblador con ayuda del catálogo de primitivas de [`builtins`],
//! dejando las llamadas a funciones de usuario como marcadores que el
//! mismo módulo resuelve a punto fijo. El listado pasa por los pases
//! de [`optimize`], se le antepone el encabezado de [`header`] y se
//! obtiene el texto final.
//!
//! # Validación
//! La máquina virtual de referencia en [`vm`] ejecuta el ensamblador
//! emitido con la misma semántica de opcodes que el firmware; el
//! evaluador de [`eval`] interpreta el fuente directamente. Con el
//! hardware determinista de [`hardware`], ambos deben coincidir en el
//! estado final de las variables del usuario.

pub mod asm;
pub mod builtins;
pub mod codegen;
pub mod decl;
pub mod error;
pub mod eval;
pub mod hardware;
pub mod header;
pub mod lex;
pub mod optimize;
pub mod parse;
pub mod source;
pub mod symbol;
pub mod vm;

use std::collections::HashMap;

use thiserror::Error;

pub use decl::{Flags, Options};
pub use error::{Compile, CompileError};

/// Resultado de una compilación exitosa.
pub struct Compiled {
    /// Texto final del programa: encabezado más listado anotado.
    pub text: String,
    /// Líneas del encabezado de declaraciones.
    pub header: Vec<String>,
    /// Listado de instrucciones ya optimizado.
    pub listing: Vec<asm::Line>,
    /// Opciones efectivas tras aplicar los pragmas del fuente.
    pub options: Options,
    /// Árbol del programa, para el evaluador de referencia.
    pub program: parse::Program,
    /// Valores iniciales declarados, como los consume el evaluador.
    pub initials: HashMap<String, u64>,
    /// Nombres declarados por el usuario o creados a nivel de módulo.
    pub user_vars: Vec<String>,
}

/// Compila un fuente ppp a su programa ensamblador.
///
/// La compilación es una función pura del texto de entrada y de los
/// pragmas activos: o retorna el programa completo o falla con un
/// [`CompileError`]; nunca se retorna un resultado parcial.
pub fn compile(source: &str) -> Compile<Compiled> {
    let mut options = Options::default();
    let mut symbols = symbol::SymbolTable::new();

    let prepared = decl::preprocess(source, &mut symbols, &mut options)?;

    // Estado inicial de variables según las declaraciones; es lo que
    // el evaluador de referencia usa como ambiente de partida
    let initials: HashMap<String, u64> = symbols
        .constants()
        .map(|constant| (constant.name.clone(), constant.value))
        .chain(
            symbols
                .variables()
                .map(|var| (var.name.clone(), var.value)),
        )
        .collect();

    let tokens = lex::tokenize(&prepared.lines)?;
    let program = parse::parse(tokens)?;

    let generator = codegen::Generator::new(&mut symbols, &options);
    let (lines, module_vars) = generator.run(&program)?;

    let mut lines = optimize::run(lines, &options);
    let header = header::write(&symbols);

    if options.flags.contains(Flags::USE_NUMERIC_LABELS) {
        optimize::apply_numeric_labels(&mut lines, header.len() + 1);
    }

    let mut text = String::new();
    for line in &header {
        text.push_str(line);
        text.push('\n');
    }
    for line in &lines {
        text.push_str(&line.render(options.comment_column));
        text.push('\n');
    }

    let mut user_vars = prepared.user_vars;
    user_vars.extend(module_vars);

    Ok(Compiled {
        text,
        header,
        listing: lines,
        options,
        program,
        initials,
        user_vars,
    })
}

/// Error de la validación cruzada VM contra evaluador.
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Vm(#[from] vm::VmError),

    #[error(transparent)]
    Eval(#[from] eval::EvalError),
}

/// Resultado de la validación cruzada.
pub struct Verification {
    pub vm: vm::RunReport,
    pub evaluated: HashMap<String, u64>,
    /// Variables de usuario donde ambos ejecutores difieren, con el
    /// valor de la VM y el del evaluador.
    pub mismatches: Vec<(String, u64, u64)>,
}

/// Ejecuta el programa compilado en ambos ejecutores de referencia y
/// compara el estado final restringido a los nombres del usuario.
pub fn verify(compiled: &Compiled) -> Result<Verification, VerifyError> {
    let report = vm::run(&compiled.text)?;
    let evaluated = eval::run(&compiled.program, &compiled.initials)?;

    let mut mismatches = Vec::new();
    for name in &compiled.user_vars {
        let vm_value = report.variables.get(name).copied().unwrap_or(0);
        let eval_value = evaluated.get(name).copied().unwrap_or(0);

        if vm_value != eval_value {
            mismatches.push((name.clone(), vm_value, eval_value));
        }
    }

    Ok(Verification {
        vm: report,
        evaluated,
        mismatches,
    })
}
