//! tests/diagnostics.rs — batteries d'erreurs de compilation.
//!
//! Vérifie l'accumulation des erreurs (mode panique + resynchronisation),
//! les règles de portée et les messages observables.

use lutin_compiler::compile;
use lutin_core::Heap;

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

fn compile_errors(source: &str) -> Vec<String> {
    let mut heap = Heap::new();
    match compile(source, &mut heap) {
        Ok(_) => Vec::new(),
        Err(errors) => errors.0.iter().map(ToString::to_string).collect(),
    }
}

fn compiles(source: &str) -> bool {
    let mut heap = Heap::new();
    compile(source, &mut heap).is_ok()
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[test]
fn two_errors_on_separate_statements_are_both_reported() {
    let errors = compile_errors("var = 1;\nprint +;\n");
    assert_eq!(errors.len(), 2, "{errors:?}");
    assert_eq!(errors[0], "[line 1] Error at '=': Expect variable name.");
    assert_eq!(errors[1], "[line 2] Error at '+': Expect expression.");
}

#[test]
fn class_then_fun_both_compile() {
    // La chaîne de déclarations est un vrai else-if : une fonction qui suit
    // une classe n'est pas avalée.
    assert!(compiles("class C {} fun f() { return 1; } var x = f();"));
}

#[test]
fn this_outside_a_class() {
    let errors = compile_errors("print this;");
    assert_eq!(errors, vec!["[line 1] Error at 'this': Can't use 'this' outside of a class."]);
}

#[test]
fn return_at_top_level() {
    let errors = compile_errors("return 1;");
    assert_eq!(errors, vec!["[line 1] Error at 'return': Can't return from top-level code."]);
}

#[test]
fn returning_a_value_from_init() {
    let errors = compile_errors("class C { init() { return 1; } }");
    assert_eq!(errors, vec!["[line 1] Error at 'return': Can't return a value from an initializer."]);
    // Le `return;` nu reste permis : il rend l'instance.
    assert!(compiles("class C { init() { return; } }"));
}

#[test]
fn reading_a_local_in_its_own_initializer() {
    let errors = compile_errors("{ var a = a; }");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'a': Can't read local variable in its own initializer."]
    );
}

#[test]
fn duplicate_local_in_same_scope() {
    let errors = compile_errors("{ var a = 1; var a = 2; }");
    assert_eq!(
        errors,
        vec!["[line 1] Error at 'a': Already a variable with this name in this scope."]
    );
    // Masquer depuis une portée interne est permis.
    assert!(compiles("{ var a = 1; { var a = 2; print a; } }"));
}

#[test]
fn invalid_assignment_target() {
    let errors = compile_errors("var a = 1; var b = 2; a * b = 3;");
    assert_eq!(errors, vec!["[line 1] Error at '=': Invalid assignment target."]);
}

#[test]
fn unterminated_string_is_reported_from_the_scanner() {
    let errors = compile_errors("print \"oops;");
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("Unterminated string."), "{errors:?}");
}

#[test]
fn error_at_end_of_input() {
    let errors = compile_errors("print 1");
    assert_eq!(errors, vec!["[line 1] Error at end: Expect ';' after value."]);
}

#[test]
fn panic_mode_reports_once_per_statement() {
    // Deux jetons fautifs dans la même instruction : un seul rapport.
    let errors = compile_errors("print + *;");
    assert_eq!(errors.len(), 1, "{errors:?}");
}
