//! Full-pipeline scenarios: source text through compile, link, the binary
//! `.mod` round trip, and execution, mirroring the worked examples in
//! SPEC_FULL.md's TESTABLE PROPERTIES section. Unlike `vm::tests`, every test
//! here goes through `Module::to_bytes`/`Module::from_bytes` so a regression
//! in the container format would show up here even if the VM never ran on an
//! un-serialized `Module`.

use arx::codegen::CodeGenerator;
use arx::error::{Error, TrapKind};
use arx::linker::Linker;
use arx::module::Module;
use arx::parser::Parser;
use arx::typechecker;
use arx::verbosity::Verbosity;
use arx::vm::{BufferOutput, VM};

fn compile_and_link(source: &str) -> Module {
    let program = Parser::parse(source, Verbosity::default()).expect("parse");
    let table = typechecker::check_program(&program).expect("typecheck");
    let out = CodeGenerator::new(Verbosity::default()).generate(&program, &table).expect("codegen");
    let linked = Linker::new(Verbosity::default()).link(out).expect("link");
    Module::from_linked(linked, program.module_name.clone())
}

fn run_through_disk(source: &str) -> String {
    let module = compile_and_link(source);
    let bytes = module.to_bytes().expect("serialize");
    let loaded = Module::from_bytes(&bytes).expect("deserialize");
    let mut out = BufferOutput::default();
    VM::run(&loaded, &mut out, Verbosity::default()).expect("run");
    out.0
}

#[test]
fn hello_world_round_trips_through_the_binary_module() {
    let source = r#"
        module Hello;
        class Main begin
          procedure main() begin
            writeln("hello, arx");
          end;
        end;
    "#;
    assert_eq!(run_through_disk(source), "hello, arx\n");
}

#[test]
fn arithmetic_survives_serialization() {
    let source = r#"
        module Arith;
        class Main begin
          procedure main() begin
            var x: integer;
            x := (2 + 3) * 4 - 1;
            writeln(x);
          end;
        end;
    "#;
    assert_eq!(run_through_disk(source), "19\n");
}

#[test]
fn inheritance_and_method_override_survive_serialization() {
    let source = r#"
        module Shapes;
        class Shape begin
          function area(): integer begin
            return 0;
          end;
        end;
        class Square extends Shape begin
          side: integer;
          procedure setSide(s: integer) begin
            side := s;
          end;
          function area(): integer begin
            return side * side;
          end;
        end;
        class Main begin
          procedure main() begin
            var sq: Square;
            sq := new Square();
            sq.setSide(4);
            writeln(sq.area());
          end;
        end;
    "#;
    assert_eq!(run_through_disk(source), "16\n");
}

#[test]
fn string_concatenation_survives_serialization() {
    let source = r#"
        module Strings;
        class Main begin
          procedure main() begin
            var greeting: string;
            greeting := "hello, " + "world";
            writeln(greeting);
          end;
        end;
    "#;
    assert_eq!(run_through_disk(source), "hello, world\n");
}

#[test]
fn conditional_picks_the_right_branch_after_a_round_trip() {
    let source = r#"
        module Cond;
        class Main begin
          procedure main() begin
            var x: integer;
            x := 7;
            if x > 5 then begin
              writeln("big");
            end else begin
              writeln("small");
            end;
          end;
        end;
    "#;
    assert_eq!(run_through_disk(source), "big\n");
}

#[test]
fn division_by_zero_traps_with_source_line_and_method_context() {
    let source = r#"
        module Div;
        class Main begin
          procedure main() begin
            var x: integer;
            x := 1;
            writeln(x / (x - 1));
          end;
        end;
    "#;
    let module = compile_and_link(source);
    let bytes = module.to_bytes().expect("serialize");
    let loaded = Module::from_bytes(&bytes).expect("deserialize");
    let mut out = BufferOutput::default();
    let err = VM::run(&loaded, &mut out, Verbosity::default()).unwrap_err();
    assert_eq!(err.kind, TrapKind::DivideByZero);
    assert_eq!(err.method.as_deref(), Some("Main.main"));
    assert!(err.line.is_some());
}

#[test]
fn a_malformed_module_is_rejected_before_the_vm_ever_runs() {
    let module = compile_and_link(
        r#"
        module Tiny;
        class Main begin
          procedure main() begin
            writeln(1);
          end;
        end;
    "#,
    );
    let mut bytes = module.to_bytes().expect("serialize");
    bytes[0] = b'X';
    let err = Module::from_bytes(&bytes).unwrap_err();
    match Error::from(err) {
        Error::Module(_) => {}
        other => panic!("expected a module error, got {other:?}"),
    }
}
