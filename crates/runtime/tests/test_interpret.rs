//! End-to-end interpreter tests: compile + run a program, assert on the
//! exact printed output (or the runtime error that unwinds).

use std::io::Write;
use std::sync::{Arc, Mutex};

use ember_runtime::{InterpretError, RuntimeErrorKind, Vm, VmOptions};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (Result<(), InterpretError>, String) {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(VmOptions::default(), Box::new(buf.clone()));
    let result = vm.interpret(source);
    let output = String::from_utf8(buf.0.lock().unwrap().clone()).expect("non-utf8 output");
    (result, output)
}

fn expect_output(source: &str, expected: &str) {
    let (result, output) = run(source);
    assert!(result.is_ok(), "program failed: {:?}\nsource: {source}", result.err());
    assert_eq!(output, expected, "source: {source}");
}

fn expect_runtime_error(source: &str, kind: RuntimeErrorKind) {
    let (result, _) = run(source);
    match result {
        Err(InterpretError::Runtime(e)) => {
            assert_eq!(e.kind, kind, "message: {}", e.message);
        }
        other => panic!("expected runtime error {kind:?}, got {other:?}"),
    }
}

#[test]
fn test_arithmetic_precedence() {
    expect_output("print 1 + 2 * 3;", "7\n");
    expect_output("print (1 + 2) * 3;", "9\n");
    expect_output("print 10 / 4;", "2.5\n");
    expect_output("print -3 + 5;", "2\n");
}

#[test]
fn test_string_concatenation() {
    expect_output("let s = \"foo\"; print s + \"bar\";", "foobar\n");
    expect_output("print \"a\" + 1;", "a1\n");
    expect_output("print 1 + \"a\";", "1a\n");
    expect_output("print \"v=\" + 2.5;", "v=2.5\n");
}

#[test]
fn test_fib() {
    expect_output(
        "fun fib(n) { if (n < 2) return n; return fib(n-1) + fib(n-2); } print fib(10);",
        "55\n",
    );
}

#[test]
fn test_closure_counter() {
    expect_output(
        "fun make() { let i = 0; fun inc() { i = i + 1; return i; } return inc; } \
         let c = make(); print c(); print c(); print c();",
        "1\n2\n3\n",
    );
}

#[test]
fn test_class_init_and_method() {
    expect_output(
        "class Pair { init(a,b) { this.a = a; this.b = b; } sum() { return this.a + this.b; } } \
         print Pair(3,4).sum();",
        "7\n",
    );
}

#[test]
fn test_array_push_pop_len() {
    expect_output(
        "let a = [10,20,30]; a.push(40); print a[-1]; a.pop(); print len(a);",
        "40\n3\n",
    );
}

#[test]
fn test_array_pop_returns_removed_element() {
    expect_output("let a = [1, 2]; print a.pop(); print len(a);", "2\n1\n");
}

#[test]
fn test_comparisons_and_logic() {
    expect_output("print 1 < 2;", "true\n");
    expect_output("print 1 >= 2;", "false\n");
    expect_output("print 2 <= 2;", "true\n");
    expect_output("print 1 != 2;", "true\n");
    expect_output("print \"x\" == \"x\";", "true\n");
    expect_output("print nil == false;", "false\n");
    expect_output("print true and false;", "false\n");
    expect_output("print false or \"y\";", "y\n");
    expect_output("print !0;", "true\n");
    expect_output("print !\"s\";", "false\n");
}

#[test]
fn test_short_circuit_skips_rhs() {
    expect_output(
        "fun boom() { print \"called\"; return true; } print false and boom(); print true or boom();",
        "false\ntrue\n",
    );
}

#[test]
fn test_ternary() {
    expect_output("print 1 < 2 ? \"yes\" : \"no\";", "yes\n");
    expect_output("print nil ? \"yes\" : \"no\";", "no\n");
}

#[test]
fn test_while_loop_with_break() {
    expect_output(
        "let i = 0; while (true) { i = i + 1; if (i == 5) break; } print i;",
        "5\n",
    );
}

#[test]
fn test_for_loop_with_continue_and_break() {
    expect_output(
        "let total = 0; \
         for (let i = 0; i < 10; i = i + 1) { \
           if (i == 3) continue; \
           if (i == 6) break; \
           total = total + i; \
         } \
         print total;",
        "12\n",
    );
}

#[test]
fn test_for_loop_without_clauses() {
    expect_output(
        "let n = 0; for (;;) { n = n + 1; if (n == 3) break; } print n;",
        "3\n",
    );
}

#[test]
fn test_switch_matches_and_falls_through() {
    let source = "switch (2) { \
                    case 1: print \"one\"; \
                    case 2: print \"two\"; \
                    case 3: print \"three\"; break; \
                    default: print \"other\"; \
                  }";
    expect_output(source, "two\nthree\n");
}

#[test]
fn test_switch_default() {
    let source = "switch (9) { case 1: print \"one\"; break; default: print \"other\"; }";
    expect_output(source, "other\n");
}

#[test]
fn test_switch_on_strings() {
    let source = "let cmd = \"stop\"; \
                  switch (cmd) { \
                    case \"go\": print 1; break; \
                    case \"stop\": print 2; break; \
                  }";
    expect_output(source, "2\n");
}

#[test]
fn test_table_literal_and_access() {
    expect_output(
        "let t = { \"a\": 1, \"b\": 2 }; print t.a; print t[\"b\"]; print len(t);",
        "1\n2\n2\n",
    );
}

#[test]
fn test_table_assignment() {
    expect_output(
        "let t = { \"a\": 1 }; t.a = 5; t[\"b\"] = 6; print t.a + t.b;",
        "11\n",
    );
}

#[test]
fn test_del_removes_table_key() {
    expect_output(
        "let t = { \"a\": 1, \"b\": 2 }; del t.a; print len(t);",
        "1\n",
    );
}

#[test]
fn test_del_removes_instance_field() {
    let source = "class Box { init() { this.x = 1; } } \
                  let b = Box(); del b.x; print b.x;";
    expect_runtime_error(source, RuntimeErrorKind::UnknownAttribute);
}

#[test]
fn test_len_on_strings() {
    expect_output("print len(\"hello\");", "5\n");
    expect_output("print len(\"\");", "0\n");
}

#[test]
fn test_len_rejects_numbers() {
    expect_runtime_error("print len(1);", RuntimeErrorKind::TypeMismatch);
}

#[test]
fn test_nested_arrays() {
    expect_output("let a = [1, [2, 3], \"s\"]; print a[1][0];", "2\n");
    expect_output("let a = [1, 2, 3]; a[-1] = 9; print a[2];", "9\n");
}

#[test]
fn test_array_display() {
    expect_output("print [1, \"two\", nil];", "[1,\"two\",nil]\n");
}

#[test]
fn test_array_index_out_of_range() {
    expect_runtime_error("let a = [1]; print a[5];", RuntimeErrorKind::IndexOutOfRange);
    expect_runtime_error("let a = [1]; print a[-2];", RuntimeErrorKind::IndexOutOfRange);
}

#[test]
fn test_array_pop_empty_is_error() {
    expect_runtime_error("let a = []; a.pop();", RuntimeErrorKind::EmptyContainer);
}

#[test]
fn test_bound_method_remembers_receiver() {
    expect_output(
        "class Greeter { init(name) { this.name = name; } hello() { return \"hi \" + this.name; } } \
         let g = Greeter(\"bob\"); let m = g.hello; print m();",
        "hi bob\n",
    );
}

#[test]
fn test_field_shadows_method_on_invoke() {
    expect_output(
        "class C { f() { return 1; } } \
         let c = C(); \
         fun two() { return 2; } \
         c.f = two; \
         print c.f();",
        "2\n",
    );
}

#[test]
fn test_init_with_bare_return_yields_receiver() {
    expect_output(
        "class C { init() { this.v = 1; return; } } print C().v;",
        "1\n",
    );
}

#[test]
fn test_instance_prints_fields() {
    expect_output("class C { init() { this.v = 1; } } print C();", "{\"v\": 1}\n");
}

#[test]
fn test_calling_class_without_init_requires_zero_args() {
    expect_runtime_error("class C {} C(1);", RuntimeErrorKind::ArityMismatch);
}

#[test]
fn test_mutual_recursion_through_globals() {
    expect_output(
        "fun is_even(n) { if (n == 0) return true; return is_odd(n - 1); } \
         fun is_odd(n) { if (n == 0) return false; return is_even(n - 1); } \
         print is_even(10);",
        "true\n",
    );
}

#[test]
fn test_shared_upvalue_between_closures() {
    expect_output(
        "fun pair() { \
           let v = 0; \
           fun get() { return v; } \
           fun set(x) { v = x; } \
           return [get, set]; \
         } \
         let fns = pair(); \
         fns[1](42); \
         print fns[0]();",
        "42\n",
    );
}

#[test]
fn test_block_scoping_shadows() {
    expect_output(
        "let x = \"outer\"; { let x = \"inner\"; print x; } print x;",
        "inner\nouter\n",
    );
}

#[test]
fn test_calling_non_function_is_error() {
    expect_runtime_error("let x = 1; x();", RuntimeErrorKind::NotCallable);
}

#[test]
fn test_negate_requires_number() {
    expect_runtime_error("print -\"s\";", RuntimeErrorKind::TypeMismatch);
}

#[test]
fn test_add_rejects_nil() {
    expect_runtime_error("print 1 + nil;", RuntimeErrorKind::TypeMismatch);
}

#[test]
fn test_subscript_on_number_is_error() {
    expect_runtime_error("let x = 1; print x[0];", RuntimeErrorKind::TypeMismatch);
}

#[test]
fn test_runtime_error_carries_call_trace() {
    let (result, _) = run("fun inner() { return 1 + nil; } fun outer() { return inner(); } outer();");
    match result {
        Err(InterpretError::Runtime(e)) => {
            let names: Vec<&str> = e.trace.iter().map(|f| f.function.as_str()).collect();
            assert_eq!(names, vec!["inner", "outer", "script"]);
        }
        other => panic!("expected runtime error, got {other:?}"),
    }
}

#[test]
fn test_compile_error_is_not_runtime_error() {
    let (result, output) = run("let = 1;");
    assert!(matches!(result, Err(InterpretError::Compile(_))));
    assert!(output.is_empty());
}

#[test]
fn test_repl_mode_prints_expression_values() {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(VmOptions::default(), Box::new(buf.clone()));
    vm.interpret_repl("1 + 2;").expect("repl line failed");
    vm.interpret_repl("let x = 10;").expect("repl line failed");
    vm.interpret_repl("x * 2;").expect("repl line failed");
    let output = String::from_utf8(buf.0.lock().unwrap().clone()).expect("non-utf8 output");
    assert_eq!(output, "3\n20\n");
}

#[test]
fn test_globals_persist_across_repl_lines() {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(VmOptions::default(), Box::new(buf.clone()));
    vm.interpret_repl("fun double(n) { return n * 2; }").expect("repl line failed");
    vm.interpret_repl("print double(21);").expect("repl line failed");
    let output = String::from_utf8(buf.0.lock().unwrap().clone()).expect("non-utf8 output");
    assert_eq!(output, "42\n");
}

#[test]
fn test_time_native_is_callable() {
    let (result, output) = run("print time(1000) >= 1000;");
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(output, "true\n");
}

#[test]
fn test_number_formatting() {
    expect_output("print 3.5;", "3.5\n");
    expect_output("print 3.0;", "3\n");
    expect_output("print 0.5 + 0.25;", "0.75\n");
    expect_output("print nil;", "nil\n");
}
