// End-to-end interpreter scenarios through the public API. Scripts make
// their own claims with assert(); a scenario passes when the script runs
// clean.

use veld_core::{VeldError, Vm};

fn run(source: &str) -> Result<(), VeldError> {
    Vm::new().interpret(source, "scenario", false)
}

fn run_ok(source: &str) {
    if let Err(err) = run(source) {
        panic!("script failed: {}", err);
    }
}

fn runtime_message(source: &str) -> String {
    match run(source) {
        Err(VeldError::Runtime(err)) => err.message,
        Err(other) => panic!("expected runtime error, got: {}", other),
        Ok(()) => panic!("expected runtime error, script ran clean"),
    }
}

#[test]
fn counter_class_counts() {
    run_ok(
        "class Counter { \
           init() { this.count = 0; } \
           inc() { this.count += 1; return this.count; } \
         } \
         var c = Counter(); \
         assert(c.inc() == 1); \
         assert(c.inc() == 2); \
         assert(c.inc() == 3);",
    );
}

#[test]
fn closure_counters_are_independent() {
    run_ok(
        "fun counter() { var n = 0; return fun() { n += 1; return n; }; } \
         var a = counter(); \
         var b = counter(); \
         assert(a() == 1); \
         assert(a() == 2); \
         assert(b() == 1); \
         assert(a() == 3);",
    );
}

#[test]
fn closures_alias_then_close_over_the_same_slot() {
    run_ok(
        "var bump; var read; \
         { \
           var shared = 10; \
           bump = fun() { shared += 1; }; \
           read = fun() { return shared; }; \
         } \
         bump(); bump(); \
         assert(read() == 12);",
    );
}

#[test]
fn arity_window_is_enforced_and_vm_recovers() {
    let mut vm = Vm::new();
    vm.interpret(
        "fun greet(name, greeting = \"hi\") { return greeting + \" \" + name; }",
        "scenario",
        false,
    )
    .unwrap();
    assert!(vm
        .interpret("greet();", "scenario", false)
        .is_err());
    // The same VM keeps working after the runtime error.
    vm.interpret(
        "assert(greet(\"ada\") == \"hi ada\"); \
         assert(greet(\"ada\", \"yo\") == \"yo ada\");",
        "scenario",
        false,
    )
    .unwrap();
}

#[test]
fn variadic_rest_collects_extras() {
    run_ok(
        "fun tally(first, ...rest) { \
           var total = first; \
           for (var i = 0; i < rest.len(); i += 1) { total += rest[i]; } \
           return total; \
         } \
         assert(tally(1) == 1); \
         assert(tally(1, 2, 3, 4) == 10);",
    );
}

#[test]
fn destructuring_checks_shape() {
    run_ok(
        "var [a, b, c] = [1, 2, 3]; \
         assert(a == 1 && b == 2 && c == 3); \
         [a, c] = [c, a]; \
         assert(a == 3 && c == 1);",
    );
    assert!(runtime_message("var [a, b] = [1, 2, 3];").contains("Too many values"));
}

#[test]
fn string_concatenation_is_interned() {
    // Interning makes content equality indistinguishable from identity.
    run_ok(
        "var joined = \"foo\" + \"bar\"; \
         assert(joined == \"foobar\"); \
         assert(\"a\" + \"b\" + \"c\" == \"abc\");",
    );
}

#[test]
fn inheritance_traits_and_abstract_enforcement() {
    run_ok(
        "trait Named { describe() { return \"I am \" + this.name; } } \
         abstract class Shape { \
           abstract area(); \
           use Named; \
         } \
         class Square < Shape { \
           init(var name, var side) {} \
           area() { return this.side * this.side; } \
         } \
         var s = Square(\"sq\", 3); \
         assert(s.area() == 9); \
         assert(s.describe() == \"I am sq\");",
    );
    assert!(
        runtime_message("abstract class S { abstract go(); } class T < S {}").contains("go")
    );
}

#[test]
fn switch_runs_exactly_one_arm() {
    run_ok(
        "fun pick(n) { \
           switch (n) { \
             case 1: return \"one\"; \
             case 2, 3: return \"few\"; \
             default: return \"many\"; \
           } \
         } \
         assert(pick(1) == \"one\"); \
         assert(pick(3) == \"few\"); \
         assert(pick(7) == \"many\");",
    );
}

#[test]
fn resource_closes_once_on_return_from_nested_loop() {
    let path = std::env::temp_dir().join("veld_nested_with.txt");
    let source = format!(
        "fun find() {{ \
           with (\"{}\", \"w\") as f {{ \
             for (var i = 0; i < 5; i += 1) {{ \
               if (i == 2) {{ return f; }} \
             }} \
           }} \
         }} \
         find().write(\"late\");",
        path.display()
    );
    assert!(runtime_message(&source).contains("closed"));
}

#[test]
fn gc_keeps_reachable_data_correct_under_churn() {
    run_ok(
        "var keep = []; \
         for (var i = 0; i < 3000; i += 1) { \
           var s = \"item-\" + str(i); \
           if (i % 500 == 0) { keep.push(s); } \
         } \
         assert(keep.len() == 6); \
         assert(keep[0] == \"item-0\"); \
         assert(keep[5] == \"item-2500\");",
    );
}

#[test]
fn compile_errors_carry_exit_code_65() {
    match run("var = ;") {
        Err(err @ VeldError::Compile(_)) => assert_eq!(err.exit_code(), 65),
        other => panic!("expected compile error, got {:?}", other.err().map(|e| e.to_string())),
    }
    match run("nil();") {
        Err(err @ VeldError::Runtime(_)) => assert_eq!(err.exit_code(), 70),
        other => panic!("expected runtime error, got {:?}", other.err().map(|e| e.to_string())),
    }
}

#[test]
fn builtin_and_file_imports_work_together() {
    let path = std::env::temp_dir().join("veld_scenario_lib.veld");
    std::fs::write(
        &path,
        "import Math; fun hypot(a, b) { return Math.sqrt(a * a + b * b); }",
    )
    .unwrap();
    let source = format!(
        "import \"{}\" as Geo; assert(Geo.hypot(3, 4) == 5);",
        path.display()
    );
    run_ok(&source);
}
