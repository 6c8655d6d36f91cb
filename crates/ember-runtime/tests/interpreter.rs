//! End-to-end behavior: source in, printed output out

mod common;

use common::run;
use pretty_assertions::assert_eq;

// ============================================================================
// Expressions and printing
// ============================================================================

#[test]
fn arithmetic_precedence() {
    assert_eq!(run("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn grouping_overrides_precedence() {
    assert_eq!(run("print (1 + 2) * 3;"), "9\n");
}

#[test]
fn unary_minus_and_not() {
    assert_eq!(run("print -(3 + 4);"), "-7\n");
    assert_eq!(run("print !true; print !nil; print !0;"), "false\ntrue\nfalse\n");
}

#[test]
fn division_keeps_fractions() {
    assert_eq!(run("print 7 / 2;"), "3.5\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run("var a = \"he\"; var b = \"llo\"; print a + b;"), "hello\n");
}

#[test]
fn literals_print_their_names() {
    assert_eq!(run("print nil; print true; print false;"), "nil\ntrue\nfalse\n");
}

#[test]
fn equality_is_total_across_types() {
    assert_eq!(
        run("print \"a\" == \"a\"; print 1 == \"1\"; print nil == false;"),
        "true\nfalse\nfalse\n"
    );
}

#[test]
fn concatenated_strings_compare_equal_to_literals() {
    // Interning makes content equality fall out of identity
    assert_eq!(run("print \"he\" + \"llo\" == \"hello\";"), "true\n");
}

#[test]
fn comparisons() {
    assert_eq!(
        run("print 1 < 2; print 2 <= 2; print 3 > 4; print 4 >= 4;"),
        "true\ntrue\nfalse\ntrue\n"
    );
}

#[test]
fn comparison_chains_with_equality() {
    assert_eq!(run("print 1 < 2 == true;"), "true\n");
}

#[test]
fn zero_and_empty_string_are_truthy() {
    assert_eq!(run("if (0) print \"yes\"; if (\"\") print \"also\";"), "yes\nalso\n");
}

// ============================================================================
// Variables and scope
// ============================================================================

#[test]
fn global_declaration_and_assignment() {
    assert_eq!(run("var x = 1; x = x + 1; print x;"), "2\n");
}

#[test]
fn uninitialized_variables_are_nil() {
    assert_eq!(run("var x; print x;"), "nil\n");
}

#[test]
fn locals_shadow_globals() {
    assert_eq!(run("var x = \"outer\"; { var x = \"inner\"; print x; } print x;"), "inner\nouter\n");
}

#[test]
fn nested_blocks_see_enclosing_locals() {
    assert_eq!(run("{ var a = 1; { var b = 2; print a + b; } }"), "3\n");
}

#[test]
fn assignment_is_an_expression() {
    assert_eq!(run("var a; var b; a = b = 2; print a; print b;"), "2\n2\n");
}

// ============================================================================
// Control flow
// ============================================================================

#[test]
fn if_else_branches() {
    assert_eq!(run("if (1 < 2) print \"then\"; else print \"else\";"), "then\n");
    assert_eq!(run("if (1 > 2) print \"then\"; else print \"else\";"), "else\n");
}

#[test]
fn while_loop() {
    assert_eq!(run("var i = 0; while (i < 3) { print i; i = i + 1; }"), "0\n1\n2\n");
}

#[test]
fn for_loop_accumulates() {
    assert_eq!(
        run("var x = 0; for (var i = 0; i < 3; i = i + 1) { x = x + i; } print x;"),
        "3\n"
    );
}

#[test]
fn for_loop_with_empty_clauses() {
    // Initializer and increment are optional; the condition still guards
    assert_eq!(
        run("var i = 0; for (; i < 2;) { print i; i = i + 1; }"),
        "0\n1\n"
    );
}

#[test]
fn for_loop_increment_runs_after_the_body() {
    assert_eq!(
        run("for (var i = 0; i < 3; i = i + 1) print i;"),
        "0\n1\n2\n"
    );
}

#[test]
fn and_or_short_circuit() {
    assert_eq!(
        run("print false and unreached(); print true or unreached();"),
        "false\ntrue\n"
    );
}

#[test]
fn and_or_yield_their_deciding_operand() {
    assert_eq!(
        run("print 1 and 2; print nil and 2; print nil or \"fallback\"; print 1 or 2;"),
        "2\nnil\nfallback\n1\n"
    );
}

// ============================================================================
// Functions
// ============================================================================

#[test]
fn function_declaration_and_call() {
    assert_eq!(
        run("fun add(a, b) { return a + b; } print add(1, 2);"),
        "3\n"
    );
}

#[test]
fn functions_print_with_their_names() {
    assert_eq!(run("fun f() {} print f; print clock;"), "<fn f>\n<native fn>\n");
}

#[test]
fn implicit_return_is_nil() {
    assert_eq!(run("fun noop() {} print noop();"), "nil\n");
}

#[test]
fn recursion() {
    assert_eq!(
        run("fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);"),
        "55\n"
    );
}

#[test]
fn functions_are_first_class() {
    assert_eq!(
        run("fun twice(f, x) { return f(f(x)); } fun inc(n) { return n + 1; } print twice(inc, 5);"),
        "7\n"
    );
}

#[test]
fn native_clock_returns_numbers() {
    assert_eq!(run("print clock() >= 0;"), "true\n");
}

#[test]
fn stack_is_balanced_across_statements() {
    // Deep expression statements leave nothing behind
    let mut source = String::new();
    for _ in 0..100 {
        source.push_str("1 + 2 * 3 - 4;");
    }
    source.push_str("print \"ok\";");
    assert_eq!(run(&source), "ok\n");
}
