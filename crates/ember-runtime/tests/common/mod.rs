//! Shared helpers for the behavioral suites
#![allow(dead_code)]

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use ember_runtime::{InterpretError, RuntimeError, Vm};

/// Growable buffer the VM writes program output into
#[derive(Clone, Default)]
pub struct CaptureBuffer(Rc<RefCell<Vec<u8>>>);

impl CaptureBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).expect("program output was not UTF-8")
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A VM wired to a capture buffer
pub fn capture_vm() -> (Vm, CaptureBuffer) {
    let buffer = CaptureBuffer::default();
    let vm = Vm::with_output(Box::new(buffer.clone()));
    (vm, buffer)
}

/// Interpret `source` and return everything it printed
pub fn run(source: &str) -> String {
    let (mut vm, buffer) = capture_vm();
    if let Err(err) = vm.interpret(source) {
        panic!("program failed:\n{}", err);
    }
    buffer.contents()
}

/// Interpret `source`, expecting a runtime error
pub fn run_runtime_err(source: &str) -> RuntimeError {
    let (mut vm, _buffer) = capture_vm();
    match vm.interpret(source) {
        Err(InterpretError::Runtime(err)) => err,
        Err(InterpretError::Compile(diags)) => panic!(
            "expected runtime error, got compile errors: {:?}",
            diags
        ),
        Ok(()) => panic!("expected runtime error, program succeeded"),
    }
}
