//! Collector behavior under real programs: stress mode collects at every
//! allocation point, which shakes out any object that was reachable only
//! from an in-progress computation.

use std::io::Write;
use std::sync::{Arc, Mutex};

use ember_core::ExternalRoots;
use ember_runtime::{Vm, VmOptions};

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

fn run_stressed(source: &str) -> (Vm, String) {
    let buf = SharedBuf::default();
    let options = VmOptions {
        stress_gc: true,
        ..VmOptions::default()
    };
    let mut vm = Vm::with_output(options, Box::new(buf.clone()));
    vm.interpret(source).expect("stressed program failed");
    let output = String::from_utf8(buf.0.lock().unwrap().clone()).expect("non-utf8 output");
    (vm, output)
}

#[test]
fn test_concatenation_survives_stress_gc() {
    let (_, output) = run_stressed(
        "let s = \"\"; \
         for (let i = 0; i < 50; i = i + 1) { s = s + \"x\"; } \
         print len(s);",
    );
    assert_eq!(output, "50\n");
}

#[test]
fn test_closures_survive_stress_gc() {
    let (_, output) = run_stressed(
        "fun make() { let i = 0; fun inc() { i = i + 1; return i; } return inc; } \
         let c = make(); print c(); print c(); print c();",
    );
    assert_eq!(output, "1\n2\n3\n");
}

#[test]
fn test_classes_survive_stress_gc() {
    let (_, output) = run_stressed(
        "class Pair { init(a,b) { this.a = a; this.b = b; } sum() { return this.a + this.b; } } \
         print Pair(3,4).sum();",
    );
    assert_eq!(output, "7\n");
}

#[test]
fn test_aggregates_survive_stress_gc() {
    let (_, output) = run_stressed(
        "let rows = []; \
         for (let i = 0; i < 10; i = i + 1) { rows.push({ \"n\": i }); } \
         print len(rows); print rows[9].n;",
    );
    assert_eq!(output, "10\n9\n");
}

#[test]
fn test_garbage_is_actually_reclaimed() {
    let (mut vm, output) = run_stressed(
        "for (let i = 0; i < 100; i = i + 1) { let t = { \"k\": [i, i, i] }; } \
         print \"done\";",
    );
    assert_eq!(output, "done\n");

    // Nothing from the loop bodies is reachable once the program ends.
    vm.heap.collect(&ExternalRoots::empty());
    assert!(
        vm.heap.live_objects() < 40,
        "heap retained {} objects",
        vm.heap.live_objects()
    );
}

#[test]
fn test_interned_strings_swept_when_unreferenced() {
    let (mut vm, _) = run_stressed("{ let s = \"only\" + \"-here\"; print len(s); }");
    vm.heap.collect(&ExternalRoots::empty());
    assert!(
        vm.heap.find_interned("only-here").is_none(),
        "dead concatenation result still interned"
    );
}

#[test]
fn test_globals_survive_collection() {
    let (mut vm, _) = run_stressed("let keep = \"important\"; print keep;");
    vm.heap.collect(&ExternalRoots::empty());
    assert!(vm.heap.find_interned("important").is_some());
}
