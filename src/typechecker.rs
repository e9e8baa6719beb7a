//! Shallow, single-pass type checker.
//!
//! Builds a [`ClassTable`] of class/field/method signatures in a pre-pass (so a
//! method can forward-reference a class declared later in the same file, the same
//! tolerance the linker extends to method offsets), then walks every method body
//! checking expression types and resolving identifiers and method-call receivers
//! against it. [`infer_expr`] and [`resolve_method_call`] are reused directly by
//! [`crate::codegen`] so the bytecode it emits for a callsite and the static
//! receiver class recorded for the linker come from one inference, not two.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::*;
use crate::env::Env;
use crate::error::TypeError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodSig {
    pub name: String,
    pub kind: MethodKind,
    pub params: Vec<TypeName>,
    pub ret: TypeName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSig {
    pub name: String,
    pub ty: TypeName,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassSig {
    pub class_id: u64,
    pub parent: Option<String>,
    pub fields: Vec<FieldSig>,
    pub methods: Vec<MethodSig>,
}

/// Class signatures keyed by name, assigned `class_id` in declaration order —
/// the same order [`crate::codegen`] lays out the CLASSES section in.
#[derive(Clone, Debug, Default)]
pub struct ClassTable {
    classes: HashMap<String, ClassSig>,
}

impl ClassTable {
    pub fn get(&self, name: &str) -> Option<&ClassSig> {
        self.classes.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ClassSig)> {
        self.classes.iter()
    }

    /// Own field declared directly on `class`, ignoring inheritance.
    fn own_field(&self, class: &str, name: &str) -> Option<&FieldSig> {
        self.classes
            .get(class)
            .and_then(|sig| sig.fields.iter().find(|f| f.name == name))
    }

    /// Field resolved by walking the parent chain starting at `class`, returning
    /// the declaring class alongside it.
    pub fn find_field<'a>(&'a self, class: &'a str, name: &str) -> Option<(&'a str, &'a FieldSig)> {
        let mut current = class;
        loop {
            if let Some(field) = self.own_field(current, name) {
                return Some((current, field));
            }
            current = self.classes.get(current)?.parent.as_deref()?;
        }
    }

    fn own_method(&self, class: &str, name: &str) -> Option<&MethodSig> {
        self.classes
            .get(class)
            .and_then(|sig| sig.methods.iter().find(|m| m.name == name))
    }

    /// Method resolved by walking the parent chain starting at `class`, returning
    /// the declaring class alongside it (overriding shadows the ancestor).
    pub fn find_method<'a>(&'a self, class: &'a str, name: &str) -> Option<(&'a str, &'a MethodSig)> {
        let mut current = class;
        loop {
            if let Some(method) = self.own_method(current, name) {
                return Some((current, method));
            }
            current = self.classes.get(current)?.parent.as_deref()?;
        }
    }
}

/// The context a single method body is checked/codegen'd against.
pub struct TypeCtx<'a> {
    pub table: &'a ClassTable,
    pub current_class: &'a str,
    pub locals: Rc<Env<TypeName>>,
}

pub fn build_class_table(program: &Program) -> Result<ClassTable, TypeError> {
    let mut classes = HashMap::new();
    for (id, class) in program.classes.iter().enumerate() {
        if classes.contains_key(&class.name) {
            return Err(TypeError::DuplicateClass {
                name: class.name.clone(),
                line: class.line,
            });
        }
        let fields = class
            .fields
            .iter()
            .map(|f| FieldSig {
                name: f.name.clone(),
                ty: f.ty.clone(),
            })
            .collect();
        let methods = class
            .methods
            .iter()
            .map(|m| MethodSig {
                name: m.name.clone(),
                kind: m.kind,
                params: m.params.iter().map(|p| p.ty.clone()).collect(),
                ret: m.ret.clone(),
            })
            .collect();
        classes.insert(
            class.name.clone(),
            ClassSig {
                class_id: id as u64,
                parent: class.parent.clone(),
                fields,
                methods,
            },
        );
    }
    for class in &program.classes {
        if let Some(parent) = &class.parent {
            if !classes.contains_key(parent) {
                return Err(TypeError::UnknownClass {
                    name: parent.clone(),
                    line: class.line,
                });
            }
        }
    }
    Ok(ClassTable { classes })
}

pub fn check_program(program: &Program) -> Result<ClassTable, TypeError> {
    let table = build_class_table(program)?;
    for class in &program.classes {
        for method in &class.methods {
            check_method(&table, class, method)?;
        }
    }
    Ok(table)
}

fn check_method(table: &ClassTable, class: &ClassDecl, method: &MethodDecl) -> Result<(), TypeError> {
    let root = Rc::new(Env::root());
    for param in &method.params {
        root.define(&param.name, param.ty.clone());
    }
    let ctx = TypeCtx {
        table,
        current_class: &class.name,
        locals: root,
    };
    for stmt in &method.body {
        check_stmt(&ctx, stmt, &method.ret)?;
    }
    Ok(())
}

fn check_stmt(ctx: &TypeCtx, stmt: &Stmt, method_ret: &TypeName) -> Result<(), TypeError> {
    match stmt {
        Stmt::VarDecl { name, ty, init, line } => {
            if let Some(init) = init {
                let actual = infer_expr(ctx, init)?;
                expect_type(&actual, ty, *line)?;
            }
            ctx.locals.define(name, ty.clone());
            Ok(())
        }
        Stmt::Assign { target, value, line } => {
            let target_ty = resolve_identifier(ctx, target, *line)?;
            let actual = infer_expr(ctx, value)?;
            expect_type(&actual, &target_ty, *line)
        }
        Stmt::Write { value, .. } => {
            infer_expr(ctx, value)?;
            Ok(())
        }
        Stmt::If {
            cond,
            then_branch,
            else_branch,
            line,
        } => {
            let cond_ty = infer_expr(ctx, cond)?;
            expect_type(&cond_ty, &TypeName::Boolean, *line)?;
            for s in then_branch {
                check_stmt(ctx, s, method_ret)?;
            }
            for s in else_branch {
                check_stmt(ctx, s, method_ret)?;
            }
            Ok(())
        }
        Stmt::While { cond, body, line } => {
            let cond_ty = infer_expr(ctx, cond)?;
            expect_type(&cond_ty, &TypeName::Boolean, *line)?;
            for s in body {
                check_stmt(ctx, s, method_ret)?;
            }
            Ok(())
        }
        Stmt::Return { value, line } => match value {
            Some(expr) => {
                let actual = infer_expr(ctx, expr)?;
                expect_type(&actual, method_ret, *line)
            }
            None => expect_type(&TypeName::Void, method_ret, *line),
        },
        Stmt::Expr { value, line } => {
            // The ISA has no opcode that discards a stack value, so a bare
            // expression statement only makes sense as a void procedure call;
            // codegen relies on this already having been checked here.
            let ty = infer_expr(ctx, value)?;
            expect_type(&ty, &TypeName::Void, *line)
        }
    }
}

fn expect_type(actual: &TypeName, expected: &TypeName, line: u32) -> Result<(), TypeError> {
    if actual == expected {
        Ok(())
    } else {
        Err(TypeError::Mismatch {
            expected: format!("{expected:?}"),
            got: format!("{actual:?}"),
            line,
        })
    }
}

/// Resolve a bare identifier: a local/parameter first, then a field of the
/// current class (reached implicitly, as the grammar has no `self` keyword).
fn resolve_identifier(ctx: &TypeCtx, name: &str, line: u32) -> Result<TypeName, TypeError> {
    if let Some(ty) = ctx.locals.get(name) {
        return Ok(ty);
    }
    if let Some((_, field)) = ctx.table.find_field(ctx.current_class, name) {
        return Ok(field.ty.clone());
    }
    Err(TypeError::Undefined {
        name: name.to_string(),
        line,
    })
}

/// Resolve a method-call expression's receiver class and signature. Shared by
/// the type checker (to validate) and codegen (to know which class's method to
/// call and to stamp the callsite table the linker disambiguates against).
pub fn resolve_method_call<'t>(
    ctx: &TypeCtx<'t>,
    receiver: &Expr,
    method_name: &str,
    args: &[Node<Expr>],
    line: u32,
) -> Result<(String, MethodSig), TypeError> {
    let receiver_ty = infer_expr(ctx, receiver)?;
    let class_name = match receiver_ty {
        TypeName::Class(name) => name,
        other => {
            return Err(TypeError::Mismatch {
                expected: "an object".to_string(),
                got: format!("{other:?}"),
                line,
            })
        }
    };
    let Some((_, sig)) = ctx.table.find_method(&class_name, method_name) else {
        return Err(TypeError::UnknownMember {
            class: class_name,
            member: method_name.to_string(),
            line,
        });
    };
    let sig = sig.clone();
    check_args(ctx, &sig, args, line)?;
    Ok((class_name, sig))
}

fn check_args(ctx: &TypeCtx, sig: &MethodSig, args: &[Node<Expr>], line: u32) -> Result<(), TypeError> {
    if args.len() != sig.params.len() {
        return Err(TypeError::Arity {
            method: sig.name.clone(),
            expected: sig.params.len(),
            got: args.len(),
            line,
        });
    }
    for (arg, expected) in args.iter().zip(&sig.params) {
        let actual = infer_expr(ctx, arg)?;
        expect_type(&actual, expected, line)?;
    }
    Ok(())
}

// `Expr` carries no line field (only `Stmt` does; see ast.rs), so errors raised
// while inferring a nested expression report line 0 rather than the enclosing
// statement's line. Acceptable for a deliberately shallow checker; a precise
// per-expression line would mean threading a line down through every AST node.
pub fn infer_expr(ctx: &TypeCtx, expr: &Expr) -> Result<TypeName, TypeError> {
    match expr {
        Expr::Int(_) => Ok(TypeName::Integer),
        Expr::Str(_) => Ok(TypeName::Str),
        Expr::Bool(_) => Ok(TypeName::Boolean),
        Expr::Id(name) => resolve_identifier(ctx, name, 0),
        Expr::New(class_name, args) => {
            if !ctx.table.classes.contains_key(class_name) {
                return Err(TypeError::UnknownClass {
                    name: class_name.clone(),
                    line: 0,
                });
            }
            match ctx.table.own_method(class_name, "init") {
                Some(sig) => {
                    let sig = sig.clone();
                    check_args(ctx, &sig, args, 0)?;
                }
                None if !args.is_empty() => {
                    return Err(TypeError::Arity {
                        method: "init".to_string(),
                        expected: 0,
                        got: args.len(),
                        line: 0,
                    })
                }
                None => {}
            }
            Ok(TypeName::Class(class_name.clone()))
        }
        Expr::Dot(receiver, field) => {
            let receiver_ty = infer_expr(ctx, receiver)?;
            let class_name = match receiver_ty {
                TypeName::Class(name) => name,
                other => {
                    return Err(TypeError::Mismatch {
                        expected: "an object".to_string(),
                        got: format!("{other:?}"),
                        line: 0,
                    })
                }
            };
            // Legal surface syntax never reaches a field through `.`; the only
            // path to a field is a bare identifier resolved against `self`. A
            // `.field` expression is therefore always an external field access.
            Err(TypeError::FieldNotAccessible {
                class: class_name,
                field: field.clone(),
                line: 0,
            })
        }
        Expr::MethodCall(receiver, name, args) => {
            let (_, sig) = resolve_method_call(ctx, receiver, name, args, 0)?;
            Ok(sig.ret)
        }
        Expr::Binary(op, lhs, rhs) => infer_binop(ctx, *op, lhs, rhs),
        Expr::Unary(op, operand) => infer_unop(ctx, *op, operand),
    }
}

fn infer_binop(ctx: &TypeCtx, op: BinOp, lhs: &Expr, rhs: &Expr) -> Result<TypeName, TypeError> {
    let l = infer_expr(ctx, lhs)?;
    let r = infer_expr(ctx, rhs)?;
    match op {
        BinOp::And | BinOp::Or => {
            expect_type(&l, &TypeName::Boolean, 0)?;
            expect_type(&r, &TypeName::Boolean, 0)?;
            Ok(TypeName::Boolean)
        }
        BinOp::Eq | BinOp::Neq => {
            expect_type(&r, &l, 0)?;
            Ok(TypeName::Boolean)
        }
        BinOp::Lt | BinOp::Leq | BinOp::Gt | BinOp::Geq => {
            expect_type(&l, &TypeName::Integer, 0)?;
            expect_type(&r, &TypeName::Integer, 0)?;
            Ok(TypeName::Boolean)
        }
        BinOp::Add if l == TypeName::Str && r == TypeName::Str => Ok(TypeName::Str),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            expect_type(&l, &TypeName::Integer, 0)?;
            expect_type(&r, &TypeName::Integer, 0)?;
            Ok(TypeName::Integer)
        }
    }
}

fn infer_unop(ctx: &TypeCtx, op: UnOp, operand: &Expr) -> Result<TypeName, TypeError> {
    let ty = infer_expr(ctx, operand)?;
    match op {
        UnOp::Neg => {
            expect_type(&ty, &TypeName::Integer, 0)?;
            Ok(TypeName::Integer)
        }
        UnOp::Not => {
            expect_type(&ty, &TypeName::Boolean, 0)?;
            Ok(TypeName::Boolean)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::verbosity::Verbosity;

    fn program(source: &str) -> Program {
        Parser::parse(source, Verbosity::default()).unwrap()
    }

    #[test]
    fn checks_hello_world() {
        let p = program(
            r#"
            module Hello;
            class Main begin
              procedure main() begin
                writeln("hi");
              end;
            end;
        "#,
        );
        assert!(check_program(&p).is_ok());
    }

    #[test]
    fn checks_method_call_and_field_assignment() {
        let p = program(
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
                b.set(7);
                writeln(b.get());
              end;
            end;
        "#,
        );
        assert!(check_program(&p).is_ok());
    }

    #[test]
    fn rejects_undefined_identifier() {
        let p = program(
            r#"
            module M;
            class Main begin
              procedure main() begin
                writeln(missing);
              end;
            end;
        "#,
        );
        assert!(matches!(
            check_program(&p),
            Err(TypeError::Undefined { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_class_name() {
        let p = program(
            r#"
            module M;
            class Box begin
            end;
            class Box begin
              procedure main() begin
              end;
            end;
        "#,
        );
        assert!(matches!(
            check_program(&p),
            Err(TypeError::DuplicateClass { ref name, .. }) if name == "Box"
        ));
    }

    #[test]
    fn rejects_arity_mismatch() {
        let p = program(
            r#"
            module M;
            class Box begin
              procedure set(x: integer) begin
              end;
            end;
            class Main begin
              procedure main() begin
                var b: Box := new Box();
                b.set();
              end;
            end;
        "#,
        );
        assert!(matches!(check_program(&p), Err(TypeError::Arity { .. })));
    }

    #[test]
    fn inherited_fields_resolve_through_the_parent_chain() {
        let p = program(
            r#"
            module M;
            class Animal begin
              name: string;
              function getName(): string begin
                return name;
              end;
            end;
            class Dog extends Animal begin
            end;
            class Main begin
              procedure main() begin
                var d: Dog := new Dog();
                writeln(d.getName());
              end;
            end;
        "#,
        );
        assert!(check_program(&p).is_ok());
    }

    #[test]
    fn external_field_access_is_rejected() {
        let p = program(
            r#"
            module M;
            class Box begin
              v: integer;
            end;
            class Main begin
              procedure main() begin
                var b: Box := new Box();
                writeln(b.v);
              end;
            end;
        "#,
        );
        assert!(matches!(
            check_program(&p),
            Err(TypeError::FieldNotAccessible { .. })
        ));
    }
}
