//! Collector behavior under stress
//!
//! Stress mode collects before every runtime allocation, so these programs
//! interleave a full mark–sweep with every closure, string, and instance
//! they create. Wrong rooting shows up as corrupted output or a panic.

mod common;

use common::capture_vm;
use pretty_assertions::assert_eq;

fn run_stressed(source: &str) -> String {
    let (mut vm, buffer) = capture_vm();
    vm.set_gc_stress(true);
    if let Err(err) = vm.interpret(source) {
        panic!("program failed under gc stress:\n{}", err);
    }
    buffer.contents()
}

#[test]
fn string_churn_survives_collection() {
    assert_eq!(
        run_stressed(
            "var s = \"\"; \
             for (var i = 0; i < 20; i = i + 1) { s = s + \"x\"; } \
             print s == \"xxxxxxxxxxxxxxxxxxxx\";"
        ),
        "true\n"
    );
}

#[test]
fn closures_and_upvalues_survive_collection() {
    assert_eq!(
        run_stressed(
            "fun make(n) { fun g() { n = n + 1; return n; } return g; } \
             var c = make(0); \
             var total = 0; \
             for (var i = 0; i < 10; i = i + 1) { total = total + c(); } \
             print total;"
        ),
        "55\n"
    );
}

#[test]
fn instances_and_fields_survive_collection() {
    assert_eq!(
        run_stressed(
            "class Node { init(value) { this.value = value; } } \
             var sum = 0; \
             for (var i = 0; i < 10; i = i + 1) { \
               var n = Node(i); \
               sum = sum + n.value; } \
             print sum;"
        ),
        "45\n"
    );
}

#[test]
fn method_tables_survive_collection() {
    assert_eq!(
        run_stressed(
            "class Greeter { init(name) { this.name = name; } \
               greet() { return \"hi \" + this.name; } } \
             print Greeter(\"gc\").greet();"
        ),
        "hi gc\n"
    );
}

#[test]
fn bound_methods_root_their_receiver() {
    assert_eq!(
        run_stressed(
            "class Holder { init() { this.kept = \"alive\"; } read() { return this.kept; } } \
             var m = Holder().read; \
             var junk = \"\"; \
             for (var i = 0; i < 20; i = i + 1) { junk = junk + \"pad\"; } \
             print m();"
        ),
        "alive\n"
    );
}

#[test]
fn unreachable_cycles_do_not_leak_forever() {
    // Closures tied back to their own cells become garbage once dropped
    let (mut vm, buffer) = capture_vm();
    vm.set_gc_stress(true);
    vm.interpret(
        "fun leak_candidate() { \
           var cell = nil; \
           fun touch() { return cell; } \
           cell = touch; } \
         for (var i = 0; i < 50; i = i + 1) { leak_candidate(); } \
         print \"done\";",
    )
    .expect("program failed");
    assert_eq!(buffer.contents(), "done\n");

    let live_before = vm.heap().object_count();
    // Another run gives the collector a chance to reclaim the cycles; the
    // heap must not keep growing with dead closures.
    vm.interpret("for (var i = 0; i < 50; i = i + 1) { leak_candidate(); } print \"again\";")
        .expect("second run failed");
    let live_after = vm.heap().object_count();
    assert!(
        live_after <= live_before + 8,
        "heap grew from {} to {}",
        live_before,
        live_after
    );
}

#[test]
fn stressed_and_unstressed_runs_agree() {
    let source = "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } \
                  class Memo { init() { this.hits = 0; } \
                    note() { this.hits = this.hits + 1; return this.hits; } } \
                  var m = Memo(); \
                  m.note(); m.note(); \
                  print fib(12); print m.note();";

    let (mut plain, plain_out) = capture_vm();
    plain.interpret(source).expect("plain run failed");

    let (mut stressed, stressed_out) = capture_vm();
    stressed.set_gc_stress(true);
    stressed.interpret(source).expect("stressed run failed");

    assert_eq!(plain_out.contents(), stressed_out.contents());
    assert_eq!(plain_out.contents(), "144\n3\n");
}
