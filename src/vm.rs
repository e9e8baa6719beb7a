//! C6: the stack machine that executes a linked module's CODE section.
//!
//! Directly grounded on the teacher's fetch/step/dispatch split
//! (`Program::fetch`, `VM::step`, `VM::dispatch`, `ControlFlow`) and its
//! `StackFrame{return_address,frame_pointer,arity}` calling convention. What's
//! new here: an object heap (`objects`), a runtime string table seeded from
//! the module's interned strings but growable (`CONCAT` produces strings that
//! never existed at compile time), and method dispatch through
//! `OBJ_CALL_METHOD` rather than the teacher's flat subroutine calls.
//!
//! `main`'s frame never goes through `OBJ_CALL_METHOD` — the module jumps
//! `pc` straight to `header.entry_point` — so [`VM::bootstrap`] synthesizes an
//! instance of the entry class itself and binds it as slot 0 before the first
//! fetch, giving `main` the same `self` convention every other method gets.

use std::collections::HashMap;

use crate::error::{Trap, TrapKind};
use crate::instruction::{Instruction, Opcode, Operator, Value};
use crate::manifest::TypeTag;
use crate::module::Module;
use crate::verbosity::Verbosity;

const MAX_STACK: usize = 1 << 16;
const MAX_CALL_DEPTH: usize = 4096;

/// Where output goes. Production code writes to stdout; tests capture into a
/// buffer so assertions don't depend on process stdout.
pub trait Output {
    fn write_int(&mut self, v: i64);
    fn write_str(&mut self, s: &str);
    fn write_char(&mut self, c: char);
    fn write_newline(&mut self);
}

pub struct StdoutOutput;

impl Output for StdoutOutput {
    fn write_int(&mut self, v: i64) {
        print!("{v}");
    }
    fn write_str(&mut self, s: &str) {
        print!("{s}");
    }
    fn write_char(&mut self, c: char) {
        print!("{c}");
    }
    fn write_newline(&mut self) {
        println!();
    }
}

#[derive(Default)]
pub struct BufferOutput(pub String);

impl Output for BufferOutput {
    fn write_int(&mut self, v: i64) {
        self.0.push_str(&v.to_string());
    }
    fn write_str(&mut self, s: &str) {
        self.0.push_str(s);
    }
    fn write_char(&mut self, c: char) {
        self.0.push(c);
    }
    fn write_newline(&mut self) {
        self.0.push('\n');
    }
}

struct StackFrame {
    return_address: u64,
    /// The caller's frame pointer, restored on `RET`; not this frame's own base.
    frame_pointer: usize,
    return_type_tag: TypeTag,
}

struct Object {
    class_id: u64,
    fields: Vec<Value>,
}

#[derive(Debug)]
enum ControlFlow {
    Advance,
    Branch(u64),
    Halt,
}

struct MethodInfo {
    arity: usize,
    return_type_tag: TypeTag,
    /// The class this method is declared on, so `OBJ_CALL_METHOD` can reject an
    /// offset that doesn't belong to the receiver's class or an ancestor.
    class_id: u64,
}

pub struct VM<'m> {
    module: &'m Module,
    stack: Vec<Value>,
    call_stack: Vec<StackFrame>,
    frame_pointer: usize,
    pc: u64,
    objects: Vec<Object>,
    strings: Vec<String>,
    methods_by_offset: HashMap<u64, MethodInfo>,
    class_slot_counts: HashMap<u64, usize>,
    /// Every class's own id plus every ancestor's, reachable through `extends`.
    /// A method resolves against a receiver only if the method's owning class
    /// appears in the receiver's own set.
    class_ancestors: HashMap<u64, Vec<u64>>,
    /// Every method's starting offset and name, ascending by offset, so a trap
    /// can report which method `pc` fell inside without a reverse offset map.
    method_spans: Vec<(u64, String)>,
    verbosity: Verbosity,
}

impl<'m> VM<'m> {
    pub fn new(module: &'m Module, verbosity: Verbosity) -> VM<'m> {
        let mut methods_by_offset = HashMap::new();
        let mut class_slot_counts = HashMap::new();
        let mut method_spans = Vec::new();
        let parent_of: HashMap<u64, u64> = module.classes.iter().map(|c| (c.entry.class_id, c.entry.parent_class_id)).collect();
        let mut class_ancestors = HashMap::new();
        for class in &module.classes {
            class_slot_counts.insert(class.entry.class_id, class.entry.instance_size as usize / 8);
            let mut chain = vec![class.entry.class_id];
            let mut current = class.entry.class_id;
            while let Some(&parent) = parent_of.get(&current) {
                if parent == crate::manifest::NO_PARENT || !parent_of.contains_key(&parent) {
                    break;
                }
                chain.push(parent);
                current = parent;
            }
            class_ancestors.insert(class.entry.class_id, chain);
            for method in &class.methods {
                methods_by_offset.insert(
                    method.offset,
                    MethodInfo {
                        arity: method.param_count as usize + 1,
                        return_type_tag: method.return_type_tag,
                        class_id: class.entry.class_id,
                    },
                );
                method_spans.push((method.offset, format!("{}.{}", class.entry.name, method.name)));
            }
        }
        method_spans.sort_by_key(|(offset, _)| *offset);
        VM {
            module,
            stack: Vec::new(),
            call_stack: Vec::new(),
            frame_pointer: 0,
            pc: 0,
            objects: Vec::new(),
            strings: module.strings.iter().map(str::to_string).collect(),
            methods_by_offset,
            class_slot_counts,
            class_ancestors,
            method_spans,
            verbosity,
        }
    }

    pub fn run(module: &'m Module, out: &mut dyn Output, verbosity: Verbosity) -> Result<(), Trap> {
        let _span = tracing::debug_span!("vm").entered();
        if verbosity.is_debug() {
            tracing::debug!(entry_point = module.entry_point, "starting vm");
        }
        let mut vm = VM::new(module, verbosity);
        vm.bootstrap().map_err(|k| vm.trap(k))?;
        loop {
            if vm.verbosity.is_trace() {
                tracing::trace!(pc = vm.pc, stack_depth = vm.stack.len(), "step");
            }
            match vm.step(out) {
                Ok(ControlFlow::Halt) => {
                    if vm.verbosity.is_debug() {
                        tracing::debug!("vm halted");
                    }
                    return Ok(());
                }
                Ok(ControlFlow::Advance) => vm.pc += 1,
                Ok(ControlFlow::Branch(target)) => vm.pc = target,
                Err(kind) => return Err(vm.trap(kind)),
            }
        }
    }

    fn trap(&self, kind: TrapKind) -> Trap {
        let line = self
            .module
            .debug
            .iter()
            .filter(|d| d.instruction_index <= self.pc)
            .max_by_key(|d| d.instruction_index)
            .map(|d| d.source_line);
        let method = self
            .method_spans
            .iter()
            .rev()
            .find(|(offset, _)| *offset <= self.pc)
            .map(|(_, name)| name.clone());
        Trap::new(self.pc, kind).with_context(method, line)
    }

    fn bootstrap(&mut self) -> Result<(), TrapKind> {
        let class_id = self
            .module
            .classes
            .iter()
            .find(|c| c.methods.iter().any(|m| m.offset == self.module.entry_point))
            .map(|c| c.entry.class_id)
            .ok_or(TrapKind::BadMethodOffset(self.module.entry_point))?;
        let handle = self.alloc_object(class_id)?;
        self.stack.push(Value::Handle(handle));
        self.frame_pointer = 0;
        self.pc = self.module.entry_point;
        Ok(())
    }

    fn alloc_object(&mut self, class_id: u64) -> Result<u32, TrapKind> {
        let slots = *self.class_slot_counts.get(&class_id).ok_or(TrapKind::BadHandle(0))?;
        self.objects.push(Object {
            class_id,
            fields: vec![Value::Int(0); slots],
        });
        Ok((self.objects.len() - 1) as u32)
    }

    fn push(&mut self, v: Value) -> Result<(), TrapKind> {
        if self.stack.len() >= MAX_STACK {
            return Err(TrapKind::StackOverflow);
        }
        self.stack.push(v);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value, TrapKind> {
        self.stack.pop().ok_or(TrapKind::StackUnderflow)
    }

    fn pop_int(&mut self) -> Result<i64, TrapKind> {
        match self.pop()? {
            Value::Int(i) => Ok(i),
            _ => Err(TrapKind::StackUnderflow),
        }
    }

    fn pop_handle(&mut self) -> Result<usize, TrapKind> {
        match self.pop()? {
            Value::Handle(h) => Ok(h as usize),
            Value::Null => Err(TrapKind::NullReceiver),
            _ => Err(TrapKind::NullReceiver),
        }
    }

    fn object(&self, handle: usize) -> Result<&Object, TrapKind> {
        self.objects.get(handle).ok_or(TrapKind::BadHandle(handle as u32))
    }

    fn frame_base(&self, depth: u32) -> Result<usize, TrapKind> {
        if depth == 0 {
            return Ok(self.frame_pointer);
        }
        // This language never nests methods, so codegen never emits a non-zero
        // depth; interpreted here as "N call frames up" for ISA completeness.
        let idx = self
            .call_stack
            .len()
            .checked_sub(depth as usize)
            .ok_or(TrapKind::BadSlot { slot: 0, len: 0 })?;
        Ok(self.call_stack[idx].frame_pointer)
    }

    fn intern_runtime(&mut self, s: String) -> u32 {
        self.strings.push(s);
        (self.strings.len() - 1) as u32
    }

    fn string(&self, id: u32) -> Result<&str, TrapKind> {
        self.strings.get(id as usize).map(String::as_str).ok_or(TrapKind::BadStringId(id))
    }

    fn enter(&mut self, target: u64, arity: usize, return_type_tag: TypeTag) -> Result<ControlFlow, TrapKind> {
        if self.call_stack.len() >= MAX_CALL_DEPTH {
            return Err(TrapKind::CallStackOverflow);
        }
        if self.stack.len() < arity {
            return Err(TrapKind::StackUnderflow);
        }
        self.call_stack.push(StackFrame {
            return_address: self.pc + 1,
            frame_pointer: self.frame_pointer,
            return_type_tag,
        });
        self.frame_pointer = self.stack.len() - arity;
        Ok(ControlFlow::Branch(target))
    }

    fn step(&mut self, out: &mut dyn Output) -> Result<ControlFlow, TrapKind> {
        let insn = self.fetch()?;
        match insn.opcode {
            Opcode::Lit => {
                self.push(Value::Int(insn.operand as i64))?;
                Ok(ControlFlow::Advance)
            }
            Opcode::Lod => {
                let (depth, slot) = crate::instruction::unpack_depth_slot(insn.operand);
                let base = self.frame_base(depth)?;
                let idx = base + slot as usize;
                let v = *self.stack.get(idx).ok_or(TrapKind::BadSlot { slot: slot as u64, len: self.stack.len() })?;
                self.push(v)?;
                Ok(ControlFlow::Advance)
            }
            Opcode::Sto => {
                let (depth, slot) = crate::instruction::unpack_depth_slot(insn.operand);
                let base = self.frame_base(depth)?;
                let idx = base + slot as usize;
                let v = self.pop()?;
                if idx >= self.stack.len() {
                    return Err(TrapKind::BadSlot { slot: slot as u64, len: self.stack.len() });
                }
                self.stack[idx] = v;
                Ok(ControlFlow::Advance)
            }
            Opcode::Int => {
                let n = insn.operand as usize;
                while self.stack.len() - self.frame_pointer < n {
                    self.push(Value::Int(0))?;
                }
                Ok(ControlFlow::Advance)
            }
            Opcode::Cal => {
                // Never emitted by this language's codegen (no free functions);
                // kept so the ISA's call primitive is actually implemented.
                self.enter(insn.operand, 0, TypeTag::Void)
            }
            Opcode::Jmp => Ok(ControlFlow::Branch(insn.operand)),
            Opcode::Jpc => {
                let cond = self.pop_int()?;
                if cond == 0 {
                    Ok(ControlFlow::Branch(insn.operand))
                } else {
                    Ok(ControlFlow::Advance)
                }
            }
            Opcode::Ret => match self.call_stack.pop() {
                None => Ok(ControlFlow::Halt),
                Some(frame) => {
                    let retval = if frame.return_type_tag != TypeTag::Void {
                        Some(self.pop()?)
                    } else {
                        None
                    };
                    self.stack.truncate(self.frame_pointer);
                    if let Some(v) = retval {
                        self.push(v)?;
                    }
                    self.frame_pointer = frame.frame_pointer;
                    Ok(ControlFlow::Branch(frame.return_address))
                }
            },
            Opcode::Opr => self.exec_operator(insn.operand, out),
        }
    }

    fn fetch(&self) -> Result<Instruction, TrapKind> {
        self.module
            .code
            .get(self.pc as usize)
            .copied()
            .ok_or(TrapKind::BadProgramCounter(self.pc))
    }

    fn exec_operator(&mut self, code: u64, out: &mut dyn Output) -> Result<ControlFlow, TrapKind> {
        let op = Operator::from_u64(code).ok_or(TrapKind::MalformedOpcode(self.pc))?;
        match op {
            Operator::Neg => {
                let a = self.pop_int()?;
                self.push(Value::Int(-a))?;
            }
            Operator::Not => {
                let a = self.pop_int()?;
                self.push(Value::Int((a == 0) as i64))?;
            }
            Operator::Add | Operator::Sub | Operator::Mul | Operator::Div | Operator::Mod => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let result = match op {
                    Operator::Add => a.wrapping_add(b),
                    Operator::Sub => a.wrapping_sub(b),
                    Operator::Mul => a.wrapping_mul(b),
                    Operator::Div => {
                        if b == 0 {
                            return Err(TrapKind::DivideByZero);
                        }
                        a.wrapping_div(b)
                    }
                    Operator::Mod => {
                        if b == 0 {
                            return Err(TrapKind::ModuloByZero);
                        }
                        a.wrapping_rem(b)
                    }
                    _ => unreachable!(),
                };
                self.push(Value::Int(result))?;
            }
            Operator::Eq | Operator::Neq | Operator::Lt | Operator::Leq | Operator::Gt | Operator::Geq => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let result = match op {
                    Operator::Eq => a == b,
                    Operator::Neq => a != b,
                    Operator::Lt => a < b,
                    Operator::Leq => a <= b,
                    Operator::Gt => a > b,
                    Operator::Geq => a >= b,
                    _ => unreachable!(),
                };
                self.push(Value::Int(result as i64))?;
            }
            Operator::And | Operator::Or => {
                let b = self.pop_int()?;
                let a = self.pop_int()?;
                let result = match op {
                    Operator::And => a != 0 && b != 0,
                    Operator::Or => a != 0 || b != 0,
                    _ => unreachable!(),
                };
                self.push(Value::Int(result as i64))?;
            }
            Operator::OutInt => {
                let v = self.pop_int()?;
                out.write_int(v);
            }
            Operator::OutString => {
                let id = self.pop_int()? as u32;
                let s = self.string(id)?.to_string();
                out.write_str(&s);
            }
            Operator::OutChar => {
                let v = self.pop_int()?;
                out.write_char(char::from_u32(v as u32).unwrap_or('\u{FFFD}'));
            }
            Operator::OutLn => out.write_newline(),
            Operator::Concat => {
                let b_id = self.pop_int()? as u32;
                let a_id = self.pop_int()? as u32;
                let mut joined = self.string(a_id)?.to_string();
                joined.push_str(self.string(b_id)?);
                let id = self.intern_runtime(joined);
                self.push(Value::Int(id as i64))?;
            }
            Operator::ObjNew => {
                let class_id = self.pop_int()? as u64;
                let handle = self.alloc_object(class_id)?;
                self.push(Value::Handle(handle))?;
            }
            Operator::ObjCallMethod => {
                let offset = self.pop_int()? as u64;
                let this = self.pop_handle()?;
                let receiver_class = self.object(this)?.class_id;
                let info = self.methods_by_offset.get(&offset).ok_or(TrapKind::BadMethodOffset(offset))?;
                let owns = self.class_ancestors.get(&receiver_class).is_some_and(|chain| chain.contains(&info.class_id));
                if !owns {
                    return Err(TrapKind::MethodNotOnClass { offset, class_id: receiver_class });
                }
                let args = info.arity - 1;
                let return_type_tag = info.return_type_tag;
                if self.stack.len() < args {
                    return Err(TrapKind::StackUnderflow);
                }
                self.stack.insert(self.stack.len() - args, Value::Handle(this as u32));
                return self.enter(offset, args + 1, return_type_tag);
            }
            Operator::ObjGetField => {
                let offset = self.pop_int()? as usize;
                let this = self.pop_handle()?;
                let object = self.object(this)?;
                let slot = offset / 8;
                let v = *object
                    .fields
                    .get(slot)
                    .ok_or(TrapKind::BadFieldOffset { offset: offset as u64, size: object.fields.len() as u64 * 8 })?;
                self.push(v)?;
            }
            Operator::ObjSetField => {
                let offset = self.pop_int()? as usize;
                let this = self.pop_handle()?;
                let value = self.pop()?;
                let slot = offset / 8;
                let object = self.objects.get_mut(this).ok_or(TrapKind::BadHandle(this as u32))?;
                if slot >= object.fields.len() {
                    return Err(TrapKind::BadFieldOffset { offset: offset as u64, size: object.fields.len() as u64 * 8 });
                }
                object.fields[slot] = value;
            }
        }
        Ok(ControlFlow::Advance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::CodeGenerator;
    use crate::linker::Linker;
    use crate::parser::Parser;
    use crate::typechecker;

    fn compile(source: &str) -> Module {
        let program = Parser::parse(source, Verbosity::default()).unwrap();
        let table = typechecker::check_program(&program).unwrap();
        let out = CodeGenerator::new(Verbosity::default()).generate(&program, &table).unwrap();
        let linked = Linker::new(Verbosity::default()).link(out).unwrap();
        Module::from_linked(linked, "test".to_string())
    }

    fn run_source(source: &str) -> String {
        let module = compile(source);
        let mut buf = BufferOutput::default();
        VM::run(&module, &mut buf, Verbosity::default()).unwrap();
        buf.0
    }

    #[test]
    fn hello_world_prints_a_line() {
        let output = run_source(
            r#"
            module Hello;
            class Main begin
              procedure main() begin
                writeln("hi");
              end;
            end;
        "#,
        );
        assert_eq!(output, "hi\n");
    }

    #[test]
    fn arithmetic_and_locals() {
        let output = run_source(
            r#"
            module M;
            class Main begin
              procedure main() begin
                var x: integer := 2;
                var y: integer := 3;
                writeln(x * y + 1);
              end;
            end;
        "#,
        );
        assert_eq!(output, "7\n");
    }

    #[test]
    fn field_read_write_through_a_method_call() {
        let output = run_source(
            r#"
            module M;
            class Box begin
              v: integer;
              procedure set(x: integer) begin
                v := x;
              end;
              function get(): integer begin
                return v;
              end;
            end;
            class Main begin
              procedure main() begin
                var b: Box := new Box();
                b.set(41);
                writeln(b.get());
              end;
            end;
        "#,
        );
        assert_eq!(output, "41\n");
    }

    #[test]
    fn string_concatenation_builds_a_new_runtime_string() {
        let output = run_source(
            r#"
            module M;
            class Main begin
              procedure main() begin
                writeln("foo" + "bar");
              end;
            end;
        "#,
        );
        assert_eq!(output, "foobar\n");
    }

    #[test]
    fn conditional_picks_the_right_branch() {
        let output = run_source(
            r#"
            module M;
            class Main begin
              procedure main() begin
                if 1 < 2 then
                  writeln("yes");
                else
                  writeln("no");
              end;
            end;
        "#,
        );
        assert_eq!(output, "yes\n");
    }

    #[test]
    fn division_by_zero_traps() {
        let module = compile(
            r#"
            module M;
            class Main begin
              procedure main() begin
                writeln(1 / 0);
              end;
            end;
        "#,
        );
        let mut buf = BufferOutput::default();
        let err = VM::run(&module, &mut buf, Verbosity::default()).unwrap_err();
        assert_eq!(err.kind, TrapKind::DivideByZero);
    }

    #[test]
    fn calling_a_method_offset_not_owned_by_the_receivers_class_traps() {
        let module = compile(
            r#"
            module M;
            class Box begin
              function get(): integer begin
                return 1;
              end;
            end;
            class Other begin
              procedure main() begin
              end;
            end;
        "#,
        );
        let mut buf = BufferOutput::default();
        let mut vm = VM::new(&module, Verbosity::default());
        let other_id = module.classes.iter().find(|c| c.entry.name == "Other").unwrap().entry.class_id;
        let box_get_offset = module
            .classes
            .iter()
            .find(|c| c.entry.name == "Box")
            .unwrap()
            .methods
            .iter()
            .find(|m| m.name == "get")
            .unwrap()
            .offset;
        let handle = vm.alloc_object(other_id).unwrap();
        vm.push(Value::Handle(handle)).unwrap();
        vm.push(Value::Int(box_get_offset as i64)).unwrap();
        let err = vm.exec_operator(Operator::ObjCallMethod as u64, &mut buf).unwrap_err();
        assert_eq!(err, TrapKind::MethodNotOnClass { offset: box_get_offset, class_id: other_id });
    }

    #[test]
    fn while_loop_accumulates() {
        let output = run_source(
            r#"
            module M;
            class Main begin
              procedure main() begin
                var i: integer := 0;
                var total: integer := 0;
                while i < 5 do begin
                  total := total + i;
                  i := i + 1;
                end
                writeln(total);
              end;
            end;
        "#,
        );
        assert_eq!(output, "10\n");
    }
}
