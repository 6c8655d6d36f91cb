//! Native functions exposed to Ember programs

use std::sync::OnceLock;
use std::time::Instant;

use crate::value::Value;
use crate::vm::Vm;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// `clock()` — seconds since process start, as a number
fn clock(_args: &[Value]) -> Value {
    let start = PROCESS_START.get_or_init(Instant::now);
    Value::Number(start.elapsed().as_secs_f64())
}

/// Register every native in the VM's globals
pub(crate) fn install(vm: &mut Vm) {
    PROCESS_START.get_or_init(Instant::now);
    vm.define_native("clock", clock);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic_and_nonnegative() {
        let a = match clock(&[]) {
            Value::Number(n) => n,
            other => panic!("clock returned {:?}", other),
        };
        let b = match clock(&[]) {
            Value::Number(n) => n,
            other => panic!("clock returned {:?}", other),
        };
        assert!(a >= 0.0);
        assert!(b >= a);
    }
}
