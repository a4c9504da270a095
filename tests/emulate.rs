use pppc::{compile, optimize, verify};

/// Compila, corre ambos ejecutores y exige acuerdo total sobre las
/// variables del usuario.
fn agree(source: &str) -> std::collections::HashMap<String, u64> {
    let compiled = compile(source).unwrap();
    let verification = verify(&compiled).unwrap();

    assert!(
        verification.mismatches.is_empty(),
        "executors disagree on {:?}: {:?}",
        source,
        verification.mismatches,
    );

    verification.evaluated
}

#[test]
fn counting_loop_agrees() {
    let finals = agree("var k = 0\nwhile k < 10:\n    k += 1\n");
    assert_eq!(finals["k"], 10);
}

#[test]
fn arithmetic_chain_agrees() {
    let finals = agree(
        "var a = 7\nvar b = 3\nvar c = 0\nc = a + b + 1\nc = c * 4\nc /= 2\nc -= 1\n",
    );
    assert_eq!(finals["c"], 21);
}

#[test]
fn elif_chain_agrees() {
    let finals = agree(
        "var mode = 2\nvar out = 0\nif mode == 1:\n    out = 10\nelif mode == 2:\n    out = 20\nelse:\n    out = 30\n",
    );
    assert_eq!(finals["out"], 20);
}

#[test]
fn or_condition_agrees() {
    let finals = agree(
        "var a = 0\nvar b = 3\nvar hit = 0\nif a > 1 or b > 1:\n    hit = 1\n",
    );
    assert_eq!(finals["hit"], 1);
}

#[test]
fn and_condition_agrees() {
    let finals = agree(
        "var a = 2\nvar b = 3\nvar hit = 0\nif a > 1 and b > 1:\n    hit = 1\n",
    );
    assert_eq!(finals["hit"], 1);
}

#[test]
fn mixed_connectives_agree() {
    let finals = agree(
        "var a = 0\nvar b = 0\nvar c = 9\nvar hit = 0\nif a > 1 and b > 1 or c > 1:\n    hit = 1\n",
    );
    assert_eq!(finals["hit"], 1);
}

#[test]
fn comparison_chain_agrees() {
    let finals = agree(
        "var low = 1\nvar mid = 5\nvar high = 9\nvar ok = 0\nif low < mid < high:\n    ok = 1\n",
    );
    assert_eq!(finals["ok"], 1);
}

#[test]
fn break_agrees() {
    let finals = agree(
        "var n = 0\nwhile n < 100:\n    n += 7\n    if n > 30:\n        break\n",
    );
    assert_eq!(finals["n"], 35);
}

#[test]
fn function_with_default_agrees() {
    let finals = agree(
        "def scale(x, gain=3):\n    return x * gain\nvar a = 5\nvar r = 0\nr = scale(a)\nr = scale(r, gain=2)\n",
    );
    assert_eq!(finals["r"], 30);
}

#[test]
fn module_mutation_from_function_agrees() {
    let finals = agree(
        "var total = 1\ndef bump():\n    total += 5\n    return total\nbump()\nbump()\n",
    );
    assert_eq!(finals["total"], 11);
}

#[test]
fn inline_and_call_paths_produce_the_same_state() {
    let source = "def f(x):\n    if x > 5: return x\n    return 0\nvar y = f(7)\n";

    let plain = agree(source);
    let inlined = agree(&format!(
        "#COMPILER_FLAG INLINE_ALL_FUNCTIONS = 1\n{}",
        source,
    ));

    assert_eq!(plain["y"], 7);
    assert_eq!(inlined["y"], 7);
}

#[test]
fn deterministic_hardware_reads_agree() {
    let finals = agree("var r = 0\nvar s = 0\nr = rand()\ns = rand()\n");

    // Dos ejecuciones del compilador completo también coinciden
    let again = agree("var r = 0\nvar s = 0\nr = rand()\ns = rand()\n");
    assert_eq!(finals, again);
}

#[test]
fn pipe_drain_totals_agree() {
    let finals = agree(
        "var total = 0\nvar v = 0\nwhile not pipe_empty():\n    v = read_pipe()\n    total += v\n",
    );

    // El pipe entrega exactamente cuatro palabras
    assert!(finals["total"] >= finals["v"]);
}

#[test]
fn time_units_are_consistent_between_executors() {
    let compiled = compile("parameter t = 100 us\nvar copy = 0\ncopy = t\n").unwrap();
    let verification = verify(&compiled).unwrap();

    assert!(verification.mismatches.is_empty());
    assert_eq!(verification.evaluated["copy"], 20_000);
    assert_eq!(verification.vm.variables["copy"], 20_000);
}

#[test]
fn optimizer_is_idempotent_over_compiled_output() {
    let sources = [
        "var k = 0\nwhile k < 10:\n    k += 1\n",
        "def f(x):\n    if x > 5: return x\n    return 0\nvar y = f(7)\n",
        "var mode = 2\nvar out = 0\nif mode == 1:\n    out = 10\nelif mode == 2:\n    out = 20\nelse:\n    out = 30\n",
    ];

    for source in sources {
        let compiled = compile(source).unwrap();
        let again = optimize::run(compiled.listing.clone(), &compiled.options);
        assert_eq!(compiled.listing, again, "optimizer not idempotent on {:?}", source);
    }
}

#[test]
fn numeric_labels_preserve_final_state() {
    let source = "var k = 0\nwhile k < 10:\n    k += 1\n";

    let symbolic = compile(source).unwrap();
    let numeric = compile(&format!(
        "#COMPILER_FLAG USE_NUMERIC_LABELS = 1\n{}",
        source,
    ))
    .unwrap();

    // Las etiquetas quedaron numéricas
    assert!(numeric
        .listing
        .iter()
        .filter_map(|line| line.label.as_deref())
        .all(|label| label.chars().all(|c| c.is_ascii_digit())));

    let first = pppc::vm::run(&symbolic.text).unwrap();
    let second = pppc::vm::run(&numeric.text).unwrap();
    assert_eq!(first.variables["k"], second.variables["k"]);
}

#[test]
fn unoptimized_output_reaches_the_same_state() {
    let source = "var k = 0\nwhile k < 10:\n    k += 1\n";

    let optimized = compile(source).unwrap();
    let raw = compile(&format!(
        "#COMPILER_FLAG ENABLE_OPTIMIZATIONS = 0\n{}",
        source,
    ))
    .unwrap();

    let first = pppc::vm::run(&optimized.text).unwrap();
    let second = pppc::vm::run(&raw.text).unwrap();

    assert_eq!(first.variables["k"], second.variables["k"]);
    // La versión optimizada nunca es más larga
    assert!(optimized.listing.len() <= raw.listing.len());
}

#[test]
fn bool_substitution_preserves_semantics() {
    let source = "var x = 3\nvar hit = 0\nif x:\n    hit = 1\n";

    let plain = compile(source).unwrap();
    let substituted = compile(&format!(
        "#COMPILER_FLAG SUBSTITUTE_BOOL_FOR_GREATER_THAN_ZERO = 1\n{}",
        source,
    ))
    .unwrap();

    assert!(substituted.listing.iter().any(|line| line.opcode() == "JMPZ"));
    assert!(substituted
        .listing
        .iter()
        .all(|line| line.code != "CMPGREATER NULL"));

    let first = pppc::vm::run(&plain.text).unwrap();
    let second = pppc::vm::run(&substituted.text).unwrap();
    assert_eq!(first.variables["hit"], 1);
    assert_eq!(second.variables["hit"], 1);
}

#[test]
fn pulse_program_emulates_with_timing() {
    let compiled = compile(
        "shutter main = 0\nparameter t = 100 us\npulse(shutter=main, duration=t)\nnop()\n",
    )
    .unwrap();

    let report = pppc::vm::run(&compiled.text).unwrap();

    // El UPDATE de 20000 ciclos domina el tiempo total
    assert!(report.cycles > 20_000);
    assert_eq!(report.dds_writes, 0);
}

#[test]
fn exit_writes_the_exitcode_to_the_pipe() {
    let compiled = compile("exitcode done = 42\nexit(done)\n").unwrap();
    let report = pppc::vm::run(&compiled.text).unwrap();

    assert_eq!(report.output, vec![42]);
}

#[test]
fn scan_point_handoff_drains_the_pipe() {
    let compiled = compile("apply_next_scan_point()\nnop()\n").unwrap();
    let report = pppc::vm::run(&compiled.text).unwrap();

    // Sin interrupciones el programa drena el pipe y continúa
    assert!(report.output.is_empty());
}
