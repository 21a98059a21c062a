//! Built-in native functions.
//!
//! A native reads its arguments from the slice the VM hands it, returns a
//! value on success, or an error message that the VM reports as a runtime
//! error. The VM replaces the callee and arguments with the result.

use std::sync::OnceLock;
use std::time::Instant;

use ember_core::{Heap, Value};

use crate::vm::Vm;

static START: OnceLock<Instant> = OnceLock::new();

pub fn install(vm: &mut Vm) {
    START.get_or_init(Instant::now);
    vm.define_native("time", time_native);
}

/// `time(x)`: seconds since VM start, plus `x`. Handy for benchmarks:
/// `let t = time(0); ...; print time(0) - t;`
fn time_native(_heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    if args.len() != 1 {
        return Err(format!("expected 1 arguments but got {}", args.len()));
    }
    let offset = args[0];
    if !offset.is_number() {
        return Err("expected first argument to be a number".to_string());
    }
    let elapsed = START.get_or_init(Instant::now).elapsed().as_secs_f64();
    Ok(Value::number(elapsed + offset.as_number()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_native_adds_offset() {
        let mut heap = Heap::new(false);
        let early = match time_native(&mut heap, &[Value::number(0.0)]) {
            Ok(v) => v.as_number(),
            Err(e) => panic!("time failed: {e}"),
        };
        let late = match time_native(&mut heap, &[Value::number(100.0)]) {
            Ok(v) => v.as_number(),
            Err(e) => panic!("time failed: {e}"),
        };
        assert!(late >= early + 100.0);
    }

    #[test]
    fn test_time_native_rejects_bad_args() {
        let mut heap = Heap::new(false);
        assert!(time_native(&mut heap, &[]).is_err());
        assert!(time_native(&mut heap, &[Value::NIL]).is_err());
    }
}
