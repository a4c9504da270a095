use pppc::{compile, CompileError, Compiled};

fn codes(compiled: &Compiled) -> Vec<String> {
    compiled
        .listing
        .iter()
        .map(|line| line.code.clone())
        .collect()
}

fn labels(compiled: &Compiled) -> Vec<String> {
    compiled
        .listing
        .iter()
        .filter_map(|line| line.label.clone())
        .collect()
}

/// Comprueba que los opcodes aparecen en el listado en este orden.
fn contains_in_order(haystack: &[String], needles: &[&str]) -> bool {
    let mut rest = haystack.iter();
    needles.iter().all(|needle| rest.any(|code| code == needle))
}

#[test]
fn shutter_pulse_sequence() {
    let compiled = compile(
        "shutter main = 0\n\
         parameter t = 100 us\n\
         pulse(shutter=main, duration=t)\n",
    )
    .unwrap();

    let codes = codes(&compiled);
    assert!(contains_in_order(
        &codes,
        &[
            "SHUTTERMASK FFFFFFFF",
            "ASYNCSHUTTER main",
            "WAITDDSWRITEDONE",
            "WAIT",
            "UPDATE 1, t",
            "COUNTERMASK NULL",
            "ASYNCINVSHUTTER main",
        ],
    ));

    // 100 us son 20000 ciclos con tick de 5 ns
    assert!(compiled
        .header
        .contains(&String::from("var t 20000, parameter, us")));
    assert!(compiled.header.contains(&String::from("var main 0, shutter")));
}

#[test]
fn threshold_loop() {
    let compiled = compile("var k = 0\nwhile k < 10:\n    k += 1\n").unwrap();

    assert!(labels(&compiled).contains(&String::from("begin_while_label_1")));

    let codes = codes(&compiled);
    assert!(contains_in_order(
        &codes,
        &["LDWR k", "CMPLESS inlinevar_for_10", "JMPNCMP end_while_label_1"],
    ));
    assert!(codes.contains(&String::from("JMP begin_while_label_1")));
    assert!(codes.contains(&String::from("INC k")));

    let report = pppc::vm::run(&compiled.text).unwrap();
    assert_eq!(report.variables["k"], 10);
}

#[test]
fn power_of_two_multiply() {
    let compiled = compile("var a = 3\na *= 8\n").unwrap();

    let codes = codes(&compiled);
    assert!(codes.contains(&String::from("SHL inlinevar_for_3")));
    assert!(codes.iter().all(|code| !code.starts_with("MULTW")));

    let report = pppc::vm::run(&compiled.text).unwrap();
    assert_eq!(report.variables["a"], 24);
}

#[test]
fn non_power_of_two_multiply_uses_multw() {
    let compiled = compile("var a = 3\na *= 6\n").unwrap();

    let codes = codes(&compiled);
    assert!(codes.contains(&String::from("MULTW inlinevar_for_6")));
    assert!(codes.iter().all(|code| !code.starts_with("SHL")));

    let report = pppc::vm::run(&compiled.text).unwrap();
    assert_eq!(report.variables["a"], 18);
}

#[test]
fn power_of_two_divide() {
    let compiled = compile("var a = 64\na /= 4\n").unwrap();

    assert!(codes(&compiled).contains(&String::from("SHR inlinevar_for_2")));

    let report = pppc::vm::run(&compiled.text).unwrap();
    assert_eq!(report.variables["a"], 16);
}

#[test]
fn inc_and_dec_collapse() {
    let compiled = compile("var k = 5\nk += 1\nk -= 1\nk += 2\n").unwrap();

    let codes = codes(&compiled);
    assert!(codes.contains(&String::from("INC k")));
    assert!(codes.contains(&String::from("DEC k")));
    assert!(contains_in_order(&codes, &["ADDW inlinevar_for_2", "STWR k"]));

    let report = pppc::vm::run(&compiled.text).unwrap();
    assert_eq!(report.variables["k"], 7);
}

const EARLY_RETURN: &str =
    "def f(x):\n    if x > 5: return x\n    return 0\nvar y = f(7)\n";

#[test]
fn early_return_without_inlining() {
    let compiled = compile(EARLY_RETURN).unwrap();

    let codes = codes(&compiled);
    assert!(codes.contains(&String::from("JMPPUSH begin_function_f_label_0")));
    assert!(codes.contains(&String::from("JMPPOP")));
    assert!(labels(&compiled).contains(&String::from("begin_function_f_label_0")));

    let report = pppc::vm::run(&compiled.text).unwrap();
    assert_eq!(report.variables["y"], 7);
}

#[test]
fn early_return_body_has_two_end_jumps() {
    // Sin optimizaciones, ambos `return` conservan su salto al final
    let source = format!("#COMPILER_FLAG ENABLE_OPTIMIZATIONS = 0\n{}", EARLY_RETURN);
    let compiled = compile(&source).unwrap();

    let jumps = codes(&compiled)
        .iter()
        .filter(|code| *code == "JMP end_function_label_0")
        .count();
    assert_eq!(jumps, 2);
}

#[test]
fn early_return_with_inlining() {
    let source = format!("#COMPILER_FLAG INLINE_ALL_FUNCTIONS = 1\n{}", EARLY_RETURN);
    let compiled = compile(&source).unwrap();

    let codes = codes(&compiled);
    assert!(codes.iter().all(|code| !code.starts_with("JMPPUSH")));
    assert!(codes.iter().all(|code| *code != "JMPPOP"));
    assert!(labels(&compiled)
        .iter()
        .all(|label| !label.starts_with("begin_function_")));

    let report = pppc::vm::run(&compiled.text).unwrap();
    assert_eq!(report.variables["y"], 7);
}

#[test]
fn pipe_drain_uses_the_query_opcode() {
    let compiled = compile("while not pipe_empty():\n    read_pipe()\n").unwrap();

    let codes = codes(&compiled);
    assert!(codes.contains(&String::from("JMPPIPEEMPTY end_while_label_1")));
    assert!(codes.contains(&String::from("READPIPE")));
    assert!(codes.iter().all(|code| !code.starts_with("CMP")));
}

#[test]
fn mutual_recursion_is_rejected() {
    let result = compile("def f():\n    g()\ndef g():\n    f()\nf()\n");

    match result {
        Err(CompileError::Recursion { names }) => {
            assert!(names.iter().any(|name| name == "f"));
            assert!(names.iter().any(|name| name == "g"));
        }
        other => panic!("expected a recursion error, got {:?}", other.map(|c| c.text)),
    }
}

#[test]
fn self_recursion_is_rejected() {
    let result = compile("def f():\n    f()\nf()\n");
    assert!(matches!(result, Err(CompileError::Recursion { .. })));
}

#[test]
fn undefined_function_call_is_rejected() {
    assert!(matches!(
        compile("g()\n"),
        Err(CompileError::UnresolvedCall { line: 1, .. }),
    ));
}

#[test]
fn missing_return_in_value_position_is_rejected() {
    let result = compile("def f():\n    nop()\nvar y = f()\n");
    assert!(matches!(result, Err(CompileError::MissingReturn { .. })));
}

#[test]
fn undeclared_name_is_rejected() {
    assert!(matches!(
        compile("x = q + 1\n"),
        Err(CompileError::Undeclared { line: 1, .. }),
    ));
}

#[test]
fn redeclaration_is_rejected() {
    assert!(matches!(
        compile("var x = 1\nvar x = 2\n"),
        Err(CompileError::Redeclaration { line: 2, .. }),
    ));
}

#[test]
fn builtin_type_demands_are_enforced() {
    let result = compile("shutter s = 0\nset_trigger(s)\n");
    assert!(matches!(result, Err(CompileError::TypeMismatch { line: 2, .. })));
}

#[test]
fn break_outside_a_loop_is_rejected() {
    assert!(matches!(
        compile("break\n"),
        Err(CompileError::Syntax { line: 1, .. }),
    ));
}

#[test]
fn empty_else_branch_is_accepted() {
    let compiled =
        compile("var x = 2\nif x > 1:\n    x = 5\nelse:\n    pass\n").unwrap();

    let report = pppc::vm::run(&compiled.text).unwrap();
    assert_eq!(report.variables["x"], 5);
}

#[test]
fn zero_argument_function_is_just_label_body_and_pop() {
    let compiled = compile("def f():\n    nop()\nf()\n").unwrap();

    let begin = compiled
        .listing
        .iter()
        .position(|line| line.label.as_deref() == Some("begin_function_f_label_0"))
        .unwrap();
    let pop = compiled
        .listing
        .iter()
        .position(|line| line.code == "JMPPOP")
        .unwrap();

    assert!(begin < pop);
    // Entre la etiqueta de inicio y el JMPPOP solo queda el cuerpo
    for line in &compiled.listing[begin..pop] {
        assert!(line.code == "NOP" || line.opcode() == "NOP");
    }
}

#[test]
fn assembly_literal_functions_substitute_arguments() {
    let compiled = compile(
        "var level = 9\nconst CH2 = 2\n@assembly\ndef burst(ch, v):\n    DACOUT ch, v\n    NOP\nburst(CH2, level)\n",
    )
    .unwrap();

    assert!(codes(&compiled).contains(&String::from("DACOUT CH2, level")));

    // La VM acepta los operandos sustituidos
    pppc::vm::run(&compiled.text).unwrap();
}

#[test]
fn every_jump_targets_a_unique_label() {
    let sources = [
        "var k = 0\nwhile k < 10:\n    k += 1\n",
        EARLY_RETURN,
        "var a = 0\nvar b = 3\nvar hit = 0\nif a > 1 or b > 1:\n    hit = 1\n",
        "var mode = 2\nvar out = 0\nif mode == 1:\n    out = 10\nelif mode == 2:\n    out = 20\nelse:\n    out = 30\n",
    ];

    for source in sources {
        let compiled = compile(source).unwrap();

        let labels = labels(&compiled);
        let mut unique = labels.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(labels.len(), unique.len(), "duplicate label in {:?}", source);

        for line in &compiled.listing {
            if let Some(target) = line.jump_target() {
                assert_eq!(
                    labels.iter().filter(|label| *label == target).count(),
                    1,
                    "jump to `{}` in {:?}",
                    target,
                    source,
                );
            }
        }
    }
}

#[test]
fn every_written_variable_appears_in_the_header() {
    let compiled = compile(EARLY_RETURN).unwrap();

    for line in &compiled.listing {
        if matches!(line.opcode(), "STWR" | "INC" | "DEC") {
            let name = line.operands()[0].to_string();
            assert!(
                compiled
                    .header
                    .iter()
                    .any(|header| header.starts_with(&format!("var {} ", name))),
                "`{}` missing from header",
                name,
            );
        }
    }
}

#[test]
fn no_redundant_pairs_survive_optimization() {
    let compiled = compile(
        "var a = 1\nvar b = 2\nvar c = 0\nc = a\nc = a\nb = c\nb = b + 1\n",
    )
    .unwrap();

    let codes = codes(&compiled);
    for pair in codes.windows(2) {
        assert!(
            !(pair[0] == pair[1] && pair[0].starts_with("LDWR")),
            "redundant load pair: {:?}",
            pair,
        );
        assert!(
            !(pair[0] == pair[1] && pair[0].starts_with("STWR")),
            "redundant store pair: {:?}",
            pair,
        );
    }
}

#[test]
fn compilation_is_deterministic() {
    let source = "var k = 0\nwhile k < 10:\n    k += 1\n";
    let first = compile(source).unwrap();
    let second = compile(source).unwrap();

    assert_eq!(first.text, second.text);
}
