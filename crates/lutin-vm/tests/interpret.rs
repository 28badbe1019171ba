//! tests/interpret.rs — batteries d'intégration pour lutin-vm.
//!
//! Chaque test pilote la VM par son API publique avec un hôte de capture :
//! on compare la sortie complète (stdout simulé) et, pour les erreurs, les
//! diagnostics (stderr simulé).

use std::cell::RefCell;
use std::rc::Rc;

use lutin_vm::{Host, InterpretError, Vm, VmOptions};

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

struct CaptureHost {
    out: Rc<RefCell<String>>,
    err: Rc<RefCell<String>>,
}

impl Host for CaptureHost {
    fn print(&mut self, line: &str) {
        let mut out = self.out.borrow_mut();
        out.push_str(line);
        out.push('\n');
    }

    fn error(&mut self, line: &str) {
        let mut err = self.err.borrow_mut();
        err.push_str(line);
        err.push('\n');
    }
}

fn run_with(source: &str, options: VmOptions) -> (Result<(), InterpretError>, String, String) {
    let out = Rc::new(RefCell::new(String::new()));
    let err = Rc::new(RefCell::new(String::new()));
    let host = CaptureHost { out: Rc::clone(&out), err: Rc::clone(&err) };
    let mut vm = Vm::with_options(options).with_host(Box::new(host));
    let result = vm.interpret(source);
    let stdout = out.borrow().clone();
    let stderr = err.borrow().clone();
    (result, stdout, stderr)
}

fn run(source: &str) -> (Result<(), InterpretError>, String, String) {
    run_with(source, VmOptions::default())
}

/// La sortie d'un programme qui doit réussir.
fn output(source: &str) -> String {
    let (result, stdout, stderr) = run(source);
    assert!(result.is_ok(), "échec inattendu: {result:?}\nstderr: {stderr}");
    stdout
}

/// Le stderr d'un programme qui doit échouer à l'exécution.
fn runtime_failure(source: &str) -> String {
    let (result, _, stderr) = run(source);
    assert!(matches!(result, Err(InterpretError::Runtime(_))), "attendu une erreur d'exécution");
    stderr
}

// -----------------------------------------------------------------------------
// Expressions & instructions
// -----------------------------------------------------------------------------

#[test]
fn arithmetic_precedence() {
    assert_eq!(output("print 1 + 2 * 3;"), "7\n");
    assert_eq!(output("print (1 + 2) * 3;"), "9\n");
    assert_eq!(output("print 10 / 4;"), "2.5\n");
    assert_eq!(output("print -(3 - 5);"), "2\n");
}

#[test]
fn value_formatting() {
    assert_eq!(output("print nil; print true; print false;"), "nil\ntrue\nfalse\n");
    assert_eq!(output("print \"\"; print \"texte\";"), "\ntexte\n");
    assert_eq!(output("fun f() {} print f; print clock;"), "<fn f>\n<native fn>\n");
}

#[test]
fn truthiness_of_zero_and_empty_string() {
    assert_eq!(output("if (0) print \"zero\"; else print \"non\";"), "zero\n");
    assert_eq!(output("if (\"\") print \"vide\"; else print \"non\";"), "vide\n");
    assert_eq!(output("print !nil; print !false; print !0;"), "true\ntrue\nfalse\n");
}

#[test]
fn equality_rules() {
    assert_eq!(output("print 1 == 1; print 1 == 2; print nil == false;"), "true\nfalse\nfalse\n");
    assert_eq!(output("print \"a\" == \"a\"; print \"a\" == \"b\";"), "true\nfalse\n");
    assert_eq!(output("print 1 != 2;"), "true\n");
}

#[test]
fn nan_comparisons_follow_the_negated_encoding() {
    // `<=` est compilé en `!(>)` : NaN <= NaN rend true, NaN < NaN false.
    assert_eq!(output("print 0/0 <= 0/0;"), "true\n");
    assert_eq!(output("print 0/0 < 0/0;"), "false\n");
    assert_eq!(output("print 0/0 == 0/0;"), "false\n");
}

#[test]
fn short_circuit_and_or() {
    // err() exploserait : le court-circuit doit l'éviter.
    assert_eq!(output("print false and err();"), "false\n");
    assert_eq!(output("print true or err();"), "true\n");
    assert_eq!(output("print 1 and 2; print nil or 3;"), "2\n3\n");
}

#[test]
fn for_loop_counts() {
    assert_eq!(output("for (var i = 0; i < 3; i = i + 1) print i;"), "0\n1\n2\n");
}

#[test]
fn while_loop_and_blocks() {
    let source = "var i = 0; while (i < 2) { print i; i = i + 1; }";
    assert_eq!(output(source), "0\n1\n");
}

#[test]
fn globals_persist_across_interprets() {
    let out = Rc::new(RefCell::new(String::new()));
    let err = Rc::new(RefCell::new(String::new()));
    let host = CaptureHost { out: Rc::clone(&out), err: Rc::clone(&err) };
    let mut vm = Vm::new().with_host(Box::new(host));
    vm.interpret("var a = 40;").expect("définition");
    vm.interpret("print a + 2;").expect("lecture");
    assert_eq!(*out.borrow(), "42\n");
}

// -----------------------------------------------------------------------------
// Chaînes & internement
// -----------------------------------------------------------------------------

#[test]
fn concatenation_result_shares_identity_with_literals() {
    assert_eq!(output("var a = \"ab\"; var b = \"c\"; print a + b == \"abc\";"), "true\n");
}

#[test]
fn concatenation_builds_longer_strings() {
    assert_eq!(output("print \"foo\" + \"\" + \"bar\";"), "foobar\n");
}

// -----------------------------------------------------------------------------
// Fonctions & fermetures
// -----------------------------------------------------------------------------

#[test]
fn function_calls_and_returns() {
    let source = "fun add(a, b) { return a + b; } print add(3, 4);";
    assert_eq!(output(source), "7\n");
}

#[test]
fn closure_survives_the_scope_that_created_it() {
    let source = "fun make(n) { fun get() { return n; } fun inc() { n = n + 1; } return get; } \
                  var g = make(41); print g();";
    assert_eq!(output(source), "41\n");
}

#[test]
fn two_closures_share_one_captured_variable() {
    let source = "
        var get; var set;
        fun make() {
          var x = 1;
          fun g() { return x; }
          fun s(v) { x = v; }
          get = g;
          set = s;
        }
        make();
        set(5);
        print get();
    ";
    // Les deux fermetures partagent la même upvalue, même après fermeture.
    assert_eq!(output(source), "5\n");
}

#[test]
fn writes_persist_in_the_closed_cell() {
    let source = "
        fun counter() {
          var n = 0;
          fun bump() { n = n + 1; return n; }
          return bump;
        }
        var c = counter();
        c(); c();
        print c();
    ";
    assert_eq!(output(source), "3\n");
}

#[test]
fn open_upvalue_list_is_drained_after_a_run() {
    let source = "
        fun outer() {
          var a = 1; var b = 2;
          fun both() { return a + b; }
          return both();
        }
        print outer();
    ";
    let mut vm = Vm::new();
    vm.interpret(source).expect("exécution");
    assert!(vm.open_upvalue_slots().is_empty());
}

#[test]
fn recursion_works() {
    let source = "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } print fib(10);";
    assert_eq!(output(source), "55\n");
}

// -----------------------------------------------------------------------------
// Classes, instances, méthodes
// -----------------------------------------------------------------------------

#[test]
fn init_binds_this_and_methods_dispatch() {
    let source = "class Greeter { init(who) { this.who = who; } hi() { print \"hi \" + this.who; } } \
                  Greeter(\"world\").hi();";
    assert_eq!(output(source), "hi world\n");
}

#[test]
fn init_returns_the_instance_even_on_bare_return() {
    assert_eq!(output("class C { init() { return; } } print C();"), "C instance\n");
    assert_eq!(output("class C { init() { this.v = 1; } } var c = C(); print c.v;"), "1\n");
}

#[test]
fn instances_are_compared_by_identity() {
    assert_eq!(output("class C {} print C() == C();"), "false\n");
    assert_eq!(output("class C {} var a = C(); var b = a; print a == b;"), "true\n");
}

#[test]
fn bound_methods_remember_their_receiver() {
    let source = "
        class C {
          init() { this.v = 7; }
          get() { return this.v; }
        }
        var c = C();
        var m = c.get;
        print m();
        print c.get == c.get;
    ";
    // Chaque accès fabrique une méthode liée neuve (création paresseuse).
    assert_eq!(output(source), "7\nfalse\n");
}

#[test]
fn fields_shadow_methods_on_get() {
    let source = "
        class C { m() { return \"methode\"; } }
        var c = C();
        print c.m();
        c.m = \"champ\";
        print c.m;
    ";
    assert_eq!(output(source), "methode\nchamp\n");
}

#[test]
fn invoking_a_callable_field_falls_back_to_a_plain_call() {
    let source = "
        fun libre() { return 9; }
        class C {}
        var c = C();
        c.f = libre;
        print c.f();
    ";
    assert_eq!(output(source), "9\n");
}

#[test]
fn class_declaration_then_function_declaration() {
    assert_eq!(output("class C {} fun f() { return 2; } print f();"), "2\n");
}

// -----------------------------------------------------------------------------
// Pool de constantes
// -----------------------------------------------------------------------------

#[test]
fn more_than_256_constants_use_the_long_encoding() {
    let mut source = String::from("print 0");
    for n in 1..300 {
        source.push_str(&format!(" + {n}"));
    }
    source.push(';');
    // 0 + 1 + … + 299
    assert_eq!(output(&source), "44850\n");
}

// -----------------------------------------------------------------------------
// Natives
// -----------------------------------------------------------------------------

#[test]
fn clock_is_a_nonnegative_number_of_seconds() {
    assert_eq!(output("print clock() >= 0;"), "true\n");
}

#[test]
fn field_natives_probe_and_remove() {
    let source = "
        class P {}
        var p = P();
        p.x = 1;
        print has_field(p, \"x\");
        print delete_field(p, \"x\");
        print has_field(p, \"x\");
    ";
    assert_eq!(output(source), "true\nnil\nfalse\n");
}

#[test]
fn native_error_channel_becomes_a_runtime_error() {
    let stderr = runtime_failure("err();");
    assert!(stderr.starts_with("Error!\n"), "{stderr}");
}

#[test]
fn native_arity_is_checked() {
    let stderr = runtime_failure("clock(1);");
    assert!(stderr.starts_with("Expected 0 arguments but got 1.\n"), "{stderr}");
}

// -----------------------------------------------------------------------------
// Erreurs d'exécution
// -----------------------------------------------------------------------------

#[test]
fn undefined_global_reports_a_stack_trace() {
    let stderr = runtime_failure("fun bad() { return x; } bad();");
    assert_eq!(stderr, "Undefined variable 'x'.\n[line 1] in bad()\n[line 1] in script\n");
}

#[test]
fn type_errors_on_arithmetic() {
    assert!(runtime_failure("print 1 + \"a\";")
        .starts_with("Operands must be two numbers or two strings.\n"));
    assert!(runtime_failure("print 1 - \"a\";").starts_with("Operands must be numbers.\n"));
    assert!(runtime_failure("print -\"a\";").starts_with("Operand must be a number.\n"));
    assert!(runtime_failure("print 1 < \"a\";").starts_with("Operands must be numbers.\n"));
}

#[test]
fn wrong_arity_is_reported() {
    let stderr = runtime_failure("fun f(a) { return a; } f(1, 2);");
    assert!(stderr.starts_with("Expected 1 arguments but got 2.\n"), "{stderr}");
}

#[test]
fn calling_a_non_callable() {
    assert!(runtime_failure("var x = 3; x();").starts_with("Can only call functions and classes.\n"));
}

#[test]
fn class_without_init_rejects_arguments() {
    let stderr = runtime_failure("class C {} C(1);");
    assert!(stderr.starts_with("Expected 0 arguments but got 1.\n"), "{stderr}");
}

#[test]
fn property_access_on_non_instances() {
    assert!(runtime_failure("var a = 1; print a.b;").starts_with("Only instances have properties.\n"));
    assert!(runtime_failure("var a = 1; a.b = 2;").starts_with("Only instances have fields.\n"));
    assert!(runtime_failure("var a = 1; a.b();").starts_with("Only instances have methods.\n"));
}

#[test]
fn missing_method_on_invoke() {
    let stderr = runtime_failure("class C {} var c = C(); c.absent();");
    assert!(stderr.starts_with("Undefined property 'absent'.\n"), "{stderr}");
}

#[test]
fn assigning_an_undefined_global_fails() {
    let stderr = runtime_failure("inconnu = 1;");
    assert!(stderr.starts_with("Undefined variable 'inconnu'.\n"), "{stderr}");
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let stderr = runtime_failure("fun f() { f(); } f();");
    assert!(stderr.starts_with("Stack overflow.\n"), "{stderr}");
}

#[test]
fn the_vm_recovers_after_a_runtime_error() {
    let out = Rc::new(RefCell::new(String::new()));
    let err = Rc::new(RefCell::new(String::new()));
    let host = CaptureHost { out: Rc::clone(&out), err: Rc::clone(&err) };
    let mut vm = Vm::new().with_host(Box::new(host));
    assert!(vm.interpret("print absent;").is_err());
    vm.interpret("print 1;").expect("la VM doit survivre");
    assert_eq!(*out.borrow(), "1\n");
}

// -----------------------------------------------------------------------------
// GC
// -----------------------------------------------------------------------------

const BUSY_PROGRAM: &str = "
    class Counter {
      init(label) { this.label = label; this.count = 0; }
      bump() { this.count = this.count + 1; return this.count; }
      describe() { return this.label + \": oui\"; }
    }
    fun adder(n) { fun add(m) { return n + m; } return add; }
    var total = 0;
    var derniere = \"\";
    for (var i = 0; i < 50; i = i + 1) {
      var c = Counter(\"c\");
      c.bump();
      c.bump();
      var f = adder(i);
      total = total + f(i) + c.count;
      derniere = c.describe() + \"!\";
    }
    print total;
    print derniere;
";

#[test]
fn stress_gc_does_not_change_observable_behaviour() {
    let (plain_result, plain_out, _) = run(BUSY_PROGRAM);
    let (stress_result, stress_out, stress_err) =
        run_with(BUSY_PROGRAM, VmOptions::default().with_stress_gc(true));
    assert!(plain_result.is_ok());
    assert!(stress_result.is_ok(), "stress: {stress_err}");
    assert_eq!(plain_out, stress_out);
    assert_eq!(plain_out, "2550\nc: oui!\n");
}

#[test]
fn stress_gc_keeps_closed_upvalues_alive() {
    let source = "
        fun boite(v) { fun lire() { return v; } return lire; }
        var l = boite(\"precieuse\");
        var bruit = \"\";
        for (var i = 0; i < 20; i = i + 1) { bruit = bruit + \"x\"; }
        print l();
    ";
    let (result, out, err) = run_with(source, VmOptions::default().with_stress_gc(true));
    assert!(result.is_ok(), "{err}");
    assert_eq!(out, "precieuse\n");
}
