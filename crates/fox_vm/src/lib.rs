pub mod chunk;
pub mod compiler;
pub mod error;
pub mod gc;
pub mod object;
pub mod opcode;
pub mod stdlib;
pub mod table;
pub mod value;
pub mod vm;

pub use error::{CompileError, ExitStatus, FatalError};
pub use value::Value;
pub use vm::Vm;

use std::path::PathBuf;

/// Compiles and runs `source` as the top-level script of a fresh `Vm`,
/// the same entry point `fox`'s file runner and REPL both call through.
/// `filename` feeds throw-site metadata and import resolution;
/// `base_path` is the second path import resolution falls back to.
pub fn interpret(source: &str, filename: impl Into<String>, base_path: PathBuf) -> InterpretOutcome {
    let mut vm = Vm::new(filename, base_path);
    let function = match compiler::compile(source, &mut vm.gc) {
        Ok(f) => f,
        Err(errors) => return InterpretOutcome::CompileError(errors),
    };
    match vm.interpret(function) {
        Ok(v) => InterpretOutcome::Value(v),
        Err(e) => InterpretOutcome::RuntimeError(e),
    }
}

pub enum InterpretOutcome {
    Value(Value),
    CompileError(Vec<CompileError>),
    RuntimeError(FatalError),
}

impl InterpretOutcome {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            InterpretOutcome::Value(_) => ExitStatus::Success,
            InterpretOutcome::CompileError(_) => ExitStatus::CompileError,
            InterpretOutcome::RuntimeError(_) => ExitStatus::RuntimeError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs `src` (which is expected to assign its answer to the global
    /// `result`) to completion and returns that global's final value.
    /// Top-level code can't `return` a value (script bodies always yield
    /// `null`, per `compiler::compile`), so tests thread results out
    /// through a global the way the language itself would.
    fn run_result(src: &str) -> Value {
        let mut vm = Vm::new("<test>", PathBuf::from("."));
        let function = compiler::compile(src, &mut vm.gc).unwrap_or_else(|e| panic!("compile error: {:?}", e));
        vm.interpret(function).unwrap_or_else(|e| panic!("runtime error: {}", e));
        vm.get_global("result").expect("script did not set `result`")
    }

    fn run_err(src: &str) -> FatalError {
        let mut vm = Vm::new("<test>", PathBuf::from("."));
        let function = compiler::compile(src, &mut vm.gc).unwrap_or_else(|e| panic!("compile error: {:?}", e));
        match vm.interpret(function) {
            Err(e) => e,
            Ok(v) => panic!("expected a runtime error, got {:?}", v),
        }
    }

    // §8 scenario 1
    #[test]
    fn scenario_arithmetic() {
        assert_eq!(run_result("var result = 1 + 2 * 3;"), Value::Number(7.0));
    }

    // §8 scenario 2
    #[test]
    fn scenario_destructure_and_list_concat() {
        assert_eq!(run_result("var a, b = [10, 20]; var result = a + b;"), Value::Number(30.0));
    }

    // §8 scenario 3
    #[test]
    fn scenario_class_initializer() {
        let src = "class C { C(x) { this.x = x; } get() = this.x; } var result = C(5).get();";
        assert_eq!(run_result(src), Value::Number(5.0));
    }

    // §8 scenario 5
    #[test]
    fn scenario_catch_binds_thrown_value() {
        let src = "var result = null; try { throw \"boom\"; } catch (e) { result = e.value; }";
        assert_eq!(run_result(src).to_string(), "boom");
    }

    // §8 scenario 6
    #[test]
    fn scenario_closure_captures_local() {
        let src = "function mk(){ var x=1; return ||x; } var f=mk(); var result = f();";
        assert_eq!(run_result(src), Value::Number(1.0));
    }

    // §8 "round-trip & idempotence": for integers a <= b, (a..b).length() == b - a
    #[test]
    fn integer_range_length() {
        assert_eq!(run_result("var result = (1..11).length();"), Value::Number(10.0));
    }

    // §8 "arity law": wrong argument count raises ArityException without
    // running any of the function's body.
    #[test]
    fn arity_mismatch_raises_before_running_body() {
        let src = "var ran = false; function f(a, b) { ran = true; } f(1);";
        let err = run_err(src);
        match err {
            FatalError::UncaughtException { name, .. } => assert_eq!(name, "ArityException"),
            other => panic!("expected ArityException, got {other}"),
        }
    }

    // §8 "boundary behaviours": negative indices address from the end.
    #[test]
    fn negative_list_index_addresses_from_the_end() {
        assert_eq!(run_result("var a = [1,2,3]; var result = a[-1];"), Value::Number(3.0));
    }

    #[test]
    fn out_of_range_negative_index_raises() {
        let err = run_err("var a = [1,2,3]; var result = a[-4];");
        match err {
            FatalError::UncaughtException { name, .. } => assert_eq!(name, "IndexOutOfBoundsException"),
            other => panic!("expected IndexOutOfBoundsException, got {other}"),
        }
    }

    // §8 "interning": for strings s1 == s2, s1 is s2 is also true.
    #[test]
    fn equal_string_literals_are_identical() {
        let src = "var s1 = \"same\"; var s2 = \"same\"; var result = s1 is s2;";
        assert_eq!(run_result(src), Value::Bool(true));
    }

    #[test]
    fn typeof_covers_every_constructor_class() {
        let src = "var result = [typeof(1), typeof(\"s\"), typeof(null), typeof(true), typeof([1])];";
        let list = run_result(src);
        match list.as_obj().map(|r| r.kind_name()) {
            Some("list") => {}
            other => panic!("expected a list, got {:?}", other),
        }
    }

    #[test]
    fn uncaught_exception_is_fatal() {
        let err = run_err("throw \"boom\";");
        assert!(matches!(err, FatalError::UncaughtException { .. }));
    }

    // §4.2 switch patterns: `|expr` applies `expr` as a predicate to the
    // switched value.
    #[test]
    fn switch_predicate_pattern_matches_via_function_call() {
        let src = "function isEven(n) = n % 2 == 0; \
                    var result = switch (4) { |isEven: \"even\" else: \"odd\" };";
        assert_eq!(run_result(src).to_string(), "even");
    }

    // §4.2 switch patterns: `!<pattern>` negates a nested pattern.
    #[test]
    fn switch_negated_pattern_inverts_the_match() {
        let src = "var result = switch (3) { !is 4: \"not four\" else: \"four\" };";
        assert_eq!(run_result(src).to_string(), "not four");
    }

    #[test]
    fn switch_in_pattern_tests_membership() {
        let src = "var result = switch (2) { in [1, 2, 3]: \"yes\" else: \"no\" };";
        assert_eq!(run_result(src).to_string(), "yes");
    }

    // `cond ? a : b` ternary, right-associative and defaulting to `null`
    // when the `:` branch is omitted.
    #[test]
    fn ternary_picks_the_matching_branch() {
        assert_eq!(run_result("var result = 1 < 2 ? \"lt\" : \"ge\";").to_string(), "lt");
        assert_eq!(run_result("var result = 1 > 2 ? \"lt\" : \"ge\";").to_string(), "ge");
    }

    #[test]
    fn ternary_without_else_yields_null_on_the_false_branch() {
        assert_eq!(run_result("var result = false ? 1;"), Value::Null);
    }

    #[test]
    fn nested_ternary_is_right_associative() {
        let src = "function grade(n) = n >= 90 ? \"A\" : n >= 80 ? \"B\" : \"C\"; \
                    var result = grade(85);";
        assert_eq!(run_result(src).to_string(), "B");
    }

    // §4.4: `+` on a List and any value appends that value as a single new
    // element — even when the right-hand value is itself a List.
    #[test]
    fn list_plus_appends_rhs_as_a_single_element() {
        let result = run_result("var result = [1, 2] + [3, 4];");
        match result.as_obj().map(|r| r.kind_name()) {
            Some("list") => {}
            other => panic!("expected a list, got {:?}", other),
        }
        assert_eq!(run_result("var result = ([1, 2] + [3, 4]).length();"), Value::Number(3.0));
        assert_eq!(run_result("var result = ([1, 2] + 3).length();"), Value::Number(3.0));
    }

    // `and`/`or` are reserved keywords (spec.md §4.1) and parse as the same
    // short-circuiting operators as `&&`/`||`.
    #[test]
    fn keyword_and_or_short_circuit_like_symbolic_operators() {
        assert_eq!(run_result("var result = true and false;"), Value::Bool(false));
        assert_eq!(run_result("var result = false or true;"), Value::Bool(true));
        let src = "var calls = 0; function bump(){ calls = calls + 1; return true; } \
                    var unused = false and bump(); var result = calls;";
        assert_eq!(run_result(src), Value::Number(0.0));
    }

    // A script's leading token must not be dropped: a bare `var` as the
    // very first thing in the source has no leading token to swallow.
    #[test]
    fn leading_keyword_of_the_script_is_not_dropped() {
        assert_eq!(run_result("var result = 1 + 2 * 3;"), Value::Number(7.0));
    }

    #[test]
    fn plain_reassignment_of_a_local_does_not_leak_a_stack_slot() {
        let src = "function f() { var x = 1; x = 2; return x; } var result = f();";
        assert_eq!(run_result(src), Value::Number(2.0));
    }

    #[test]
    fn plain_reassignment_of_a_global_works() {
        assert_eq!(run_result("var x = 1; x = 2; var result = x;"), Value::Number(2.0));
    }

    #[test]
    fn compound_assignment_applies_its_operator() {
        let src = "function f() { var x = 10; x += 5; x *= 2; return x; } var result = f();";
        assert_eq!(run_result(src), Value::Number(30.0));
    }

    #[test]
    fn compound_assignment_on_a_global_applies_its_operator() {
        assert_eq!(run_result("var x = 10; x += 5; var result = x;"), Value::Number(15.0));
    }

    // §4.4 / §8 "boundary behaviours": ascending, descending, and empty ranges.
    #[test]
    fn range_handles_ascending_descending_and_empty() {
        assert_eq!(run_result("var result = (1..5).length();"), Value::Number(4.0));
        assert_eq!(run_result("var result = (5..1).length();"), Value::Number(4.0));
        assert_eq!(run_result("var result = (3..3).length();"), Value::Number(0.0));
        assert_eq!(run_result("var a = 5..1; var result = a[0];"), Value::Number(5.0));
    }

    #[test]
    fn range_rejects_fractional_bounds() {
        let err = run_err("var result = (1.5..4);");
        match err {
            FatalError::UncaughtException { name, .. } => assert_eq!(name, "TypeException"),
            other => panic!("expected TypeException, got {other}"),
        }
    }

    // spec.md §4.4: `++`/`--` are among the overloadable operator spellings.
    #[test]
    fn increment_dispatches_to_operator_overload_on_instances() {
        let src = "class Counter { \
                       Counter(n) { this.n = n; } \
                       operator ++ () = Counter(this.n + 1); \
                   } \
                   var c = Counter(1); \
                   c++; \
                   var result = c.n;";
        assert_eq!(run_result(src), Value::Number(2.0));
    }

    // §8 scenario 4: `foreach` over a String's `iterator()` visits each
    // character in order. Builds the list out through `append` instead of
    // `print`, since `print`'s observable effect is stdout, not a value.
    #[test]
    fn scenario_foreach_over_string_visits_each_character() {
        let src = "var out = []; foreach (var c in \"ab\") out.append(c); var result = out;";
        let result = run_result(src);
        match &*result.as_obj().expect("list").data() {
            crate::object::ObjData::List(l) => {
                assert_eq!(l.items.len(), 2);
                assert_eq!(l.items[0].to_string(), "a");
                assert_eq!(l.items[1].to_string(), "b");
            }
            other => panic!("expected a list, got {:?}", other),
        }
    }

    // §4.4 `import`: a module's `export ... as name;` bindings surface as
    // fields on the `<import>` instance the importer receives.
    #[test]
    fn import_exposes_exported_bindings_as_instance_fields() {
        let dir = std::env::temp_dir().join(format!("fox_import_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("create temp import dir");
        let module_path = dir.join("greeting.fox");
        std::fs::write(&module_path, "var message = \"hi\"; export message as message;").expect("write module");

        let src = "import greeting; var result = greeting.message;";
        let mut vm = Vm::new("<test>", dir.clone());
        let function = compiler::compile(src, &mut vm.gc).unwrap_or_else(|e| panic!("compile error: {:?}", e));
        vm.interpret(function).unwrap_or_else(|e| panic!("runtime error: {}", e));
        assert_eq!(vm.get_global("result").expect("script did not set `result`").to_string(), "hi");

        let _ = std::fs::remove_file(&module_path);
        let _ = std::fs::remove_dir(&dir);
    }
}
