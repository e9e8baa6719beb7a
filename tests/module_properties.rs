//! Property tests for SPEC_FULL.md's TESTABLE PROPERTIES: the `.mod` container
//! round-trips losslessly, and string interning is idempotent and
//! exact-content-deduplicating.

use quickcheck_macros::quickcheck;

use arx::codegen::CodeGenerator;
use arx::instruction::{Instruction, Opcode};
use arx::linker::Linker;
use arx::manifest::StringTable;
use arx::module::Module;
use arx::parser::Parser;
use arx::typechecker;
use arx::verbosity::Verbosity;

fn opcode_from_index(i: u8) -> Opcode {
    match i % 9 {
        0 => Opcode::Lit,
        1 => Opcode::Opr,
        2 => Opcode::Lod,
        3 => Opcode::Sto,
        4 => Opcode::Cal,
        5 => Opcode::Int,
        6 => Opcode::Jmp,
        7 => Opcode::Jpc,
        _ => Opcode::Ret,
    }
}

/// `Instruction::from_bytes(instruction.to_bytes())` must reproduce the exact
/// instruction for every opcode/operand pair the format admits.
#[quickcheck]
fn instruction_bytes_round_trip(opcode_index: u8, operand: u64) -> bool {
    let instruction = Instruction {
        opcode: opcode_from_index(opcode_index),
        operand,
    };
    Instruction::from_bytes(instruction.to_bytes()) == Some(instruction)
}

/// Interning the same string twice (in any position relative to other strings)
/// always returns the same id, and never grows the table.
#[quickcheck]
fn string_table_interning_is_idempotent(strings: Vec<String>, repeat_index: usize) -> bool {
    if strings.is_empty() {
        return true;
    }
    let mut table = StringTable::new();
    let ids: Vec<u32> = strings.iter().map(|s| table.intern(s)).collect();
    let len_after_first_pass = table.len();

    let pick = &strings[repeat_index % strings.len()];
    let id_again = table.intern(pick);
    let expected_id = ids[repeat_index % strings.len()];

    id_again == expected_id && table.len() == len_after_first_pass
}

/// Two strings with identical byte content intern to the same id even when
/// inserted far apart, and distinct content always gets a distinct id.
#[quickcheck]
fn string_table_dedups_by_exact_content(a: String, b: String) -> bool {
    let mut table = StringTable::new();
    let id_a1 = table.intern(&a);
    let id_b = table.intern(&b);
    let id_a2 = table.intern(&a);

    if a == b {
        id_a1 == id_b && id_a1 == id_a2
    } else {
        id_a1 == id_a2 && id_a1 != id_b
    }
}

fn compile_source(source: &str) -> Module {
    let program = Parser::parse(source, Verbosity::default()).expect("parse");
    let table = typechecker::check_program(&program).expect("typecheck");
    let out = CodeGenerator::new(Verbosity::default()).generate(&program, &table).expect("codegen");
    let linked = Linker::new(Verbosity::default()).link(out).expect("link");
    Module::from_linked(linked, program.module_name.clone())
}

/// `Module::from_bytes(module.to_bytes())` reproduces the module exactly, for
/// a range of small programs shaped by the quickcheck-supplied integer and
/// identifier length.
#[quickcheck]
fn compiled_module_round_trips_through_bytes(literal: i32, extra_field_count: u8) -> bool {
    let literal = literal as i64;
    let field_count = (extra_field_count % 5) as usize;

    let mut fields = String::new();
    let mut inits = String::new();
    for i in 0..field_count {
        fields.push_str(&format!("f{i}: integer;\n"));
        inits.push_str(&format!("f{i} := {i};\n"));
    }

    let source = format!(
        r#"
        module Prop;
        class Main begin
          {fields}
          procedure main() begin
            var x: integer;
            x := {literal};
            {inits}
            writeln(x);
          end;
        end;
    "#
    );

    let module = compile_source(&source);
    let bytes = module.to_bytes().expect("serialize");
    let parsed = Module::from_bytes(&bytes).expect("deserialize");
    parsed == module
}
