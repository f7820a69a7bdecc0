//! End-to-end runtime tests: instantiation, invocation, traps, linking and
//! the table/memory sandboxing behavior, driven through the tree-walking
//! test engine.

mod support;

use support::InterpEngine;
use wavelet::ir::{self, Operator};
use wavelet::runner::{self, RunError};
use wavelet::types::{
    ExternKind, FunctionType, GlobalType, MemoryType, Mutability, TableType, Type, Value,
};
use wavelet::vm::{
    invoke_function_checked, link_module, Compartment, Extern, RuntimeError, TrapCode,
};
use wavelet::RootResolver;

fn export(name: &str, kind: ExternKind, index: u32) -> ir::Export {
    ir::Export {
        name: name.to_string(),
        kind,
        index,
    }
}

/// `(module (func (export "f") (result i32) i32.const 42))`
fn const_42_module() -> ir::Module {
    let mut module = ir::Module::default();
    module.types.push(FunctionType::new(vec![], vec![Type::I32]));
    module.functions.defs.push(ir::FunctionDef {
        type_index: 0,
        non_parameter_locals: vec![],
        code: vec![Operator::I32Const { value: 42 }, Operator::End {}],
    });
    module.exports.push(export("f", ExternKind::Function, 0));
    module
}

/// `(module (memory 1) (func (export "store") ...) (func (export "load") ...))`
fn store_load_module() -> ir::Module {
    let mut module = ir::Module::default();
    module
        .types
        .push(FunctionType::new(vec![Type::I32, Type::I32], vec![]));
    module
        .types
        .push(FunctionType::new(vec![Type::I32], vec![Type::I32]));
    module.memories.defs.push(ir::MemoryDef {
        ty: MemoryType::new(1u32, None, false),
    });
    module.functions.defs.push(ir::FunctionDef {
        type_index: 0,
        non_parameter_locals: vec![],
        code: vec![
            Operator::LocalGet { local_index: 0 },
            Operator::LocalGet { local_index: 1 },
            Operator::I32Store { align: 2, offset: 0 },
            Operator::End {},
        ],
    });
    module.functions.defs.push(ir::FunctionDef {
        type_index: 1,
        non_parameter_locals: vec![],
        code: vec![
            Operator::LocalGet { local_index: 0 },
            Operator::I32Load { align: 2, offset: 0 },
            Operator::End {},
        ],
    });
    module.exports.push(export("store", ExternKind::Function, 0));
    module.exports.push(export("load", ExternKind::Function, 1));
    module
}

fn exported_function(
    instantiation: &runner::Instantiation,
    name: &str,
) -> wavelet::vm::FunctionRef {
    match instantiation.instance.export(name) {
        Some(Extern::Function(function)) => function,
        other => panic!("export {} is not a function: {:?}", name, other),
    }
}

#[test]
fn invoking_a_constant_function_returns_its_value() -> anyhow::Result<()> {
    let engine = InterpEngine::new();
    let module = const_42_module();
    let instantiation = runner::instantiate(&engine, &module, "const42")?;
    let f = exported_function(&instantiation, "f");

    let results = invoke_function_checked(&instantiation.context, f, &[])?;
    assert_eq!(results, vec![Value::I32(42)]);
    Ok(())
}

#[test]
fn stores_are_observable_through_loads() -> anyhow::Result<()> {
    let engine = InterpEngine::new();
    let module = store_load_module();
    let instantiation = runner::instantiate(&engine, &module, "memory")?;
    let store = exported_function(&instantiation, "store");
    let load = exported_function(&instantiation, "load");

    let deadbeef = 0xdead_beef_u32 as i32;
    invoke_function_checked(
        &instantiation.context,
        store,
        &[Value::I32(0), Value::I32(deadbeef)],
    )?;
    let results = invoke_function_checked(&instantiation.context, load, &[Value::I32(0)])?;
    assert_eq!(results, vec![Value::I32(deadbeef)]);
    Ok(())
}

#[test]
fn out_of_bounds_loads_trap() {
    let engine = InterpEngine::new();
    let module = store_load_module();
    let instantiation = runner::instantiate(&engine, &module, "memory").unwrap();
    let load = exported_function(&instantiation, "load");

    // One page is committed; offset 65536 is the first byte past it.
    let error =
        invoke_function_checked(&instantiation.context, load, &[Value::I32(65536)]).unwrap_err();
    match error {
        RuntimeError::Trap(trap) => {
            assert_eq!(trap.code, TrapCode::OutOfBoundsMemoryAccess);
        }
        other => panic!("expected a trap, got {}", other),
    }
}

/// `(module (table 1 anyfunc) (func $g (result i32) i32.const 7)
///   (elem (i32.const 0) $g)
///   (func (export "call0") (result i32) i32.const 0 call_indirect (result i32)))`
fn call_indirect_module(with_elem: bool) -> ir::Module {
    let mut module = ir::Module::default();
    module.types.push(FunctionType::new(vec![], vec![Type::I32]));
    module.tables.defs.push(ir::TableDef {
        ty: TableType::new(Type::FuncRef, 1, Some(1)),
    });
    module.functions.defs.push(ir::FunctionDef {
        type_index: 0,
        non_parameter_locals: vec![],
        code: vec![Operator::I32Const { value: 7 }, Operator::End {}],
    });
    module.functions.defs.push(ir::FunctionDef {
        type_index: 0,
        non_parameter_locals: vec![],
        code: vec![
            Operator::I32Const { value: 0 },
            Operator::CallIndirect {
                type_index: 0,
                table_index: 0,
            },
            Operator::End {},
        ],
    });
    if with_elem {
        module.elem_segments.push(ir::ElemSegment {
            is_active: true,
            table_index: 0,
            base_offset: ir::InitializerExpression::I32Const(0),
            indices: vec![0],
        });
    }
    module.exports.push(export("call0", ExternKind::Function, 1));
    module
}

#[test]
fn call_indirect_reaches_the_table_element() {
    let engine = InterpEngine::new();
    let module = call_indirect_module(true);
    let instantiation = runner::instantiate(&engine, &module, "indirect").unwrap();
    let call0 = exported_function(&instantiation, "call0");

    let results = invoke_function_checked(&instantiation.context, call0, &[]).unwrap();
    assert_eq!(results, vec![Value::I32(7)]);
}

#[test]
fn call_indirect_through_an_uninitialized_slot_traps() {
    let engine = InterpEngine::new();
    // Same table shape, but no elem segment: the slot holds the
    // uninitialized sentinel, whose encoded type never matches.
    let module = call_indirect_module(false);
    let instantiation = runner::instantiate(&engine, &module, "indirect").unwrap();
    let call0 = exported_function(&instantiation, "call0");

    let error = invoke_function_checked(&instantiation.context, call0, &[]).unwrap_err();
    match error {
        RuntimeError::Trap(trap) => {
            assert_eq!(trap.code, TrapCode::IndirectCallSignatureMismatch);
        }
        other => panic!("expected a trap, got {}", other),
    }
}

#[test]
fn empty_data_segment_with_out_of_bounds_base_fails_instantiation() {
    let engine = InterpEngine::new();
    let mut module = ir::Module::default();
    module.memories.defs.push(ir::MemoryDef {
        ty: MemoryType::new(1u32, None, false),
    });
    module.data_segments.push(ir::DataSegment {
        is_active: true,
        memory_index: 0,
        base_offset: ir::InitializerExpression::I32Const(65537),
        data: vec![],
    });

    let error = runner::instantiate(&engine, &module, "oob-data").unwrap_err();
    match error {
        RunError::Runtime(RuntimeError::Trap(trap)) => {
            assert_eq!(trap.code, TrapCode::OutOfBoundsMemoryAccess);
        }
        other => panic!("expected a trap, got {}", other),
    }
}

#[test]
fn active_data_segments_are_applied() {
    let engine = InterpEngine::new();
    let mut module = store_load_module();
    module.data_segments.push(ir::DataSegment {
        is_active: true,
        memory_index: 0,
        base_offset: ir::InitializerExpression::I32Const(8),
        data: vec![0x01, 0x02, 0x03, 0x04],
    });

    let instantiation = runner::instantiate(&engine, &module, "data").unwrap();
    let load = exported_function(&instantiation, "load");
    let results =
        invoke_function_checked(&instantiation.context, load, &[Value::I32(8)]).unwrap();
    assert_eq!(results, vec![Value::I32(0x0403_0201)]);
}

#[test]
fn run_module_returns_mains_exit_code() {
    let engine = InterpEngine::new();
    let mut module = ir::Module::default();
    module.types.push(FunctionType::new(vec![], vec![Type::I32]));
    module.functions.defs.push(ir::FunctionDef {
        type_index: 0,
        non_parameter_locals: vec![],
        code: vec![
            Operator::I32Const { value: 40 },
            Operator::I32Const { value: 2 },
            Operator::I32Add {},
            Operator::End {},
        ],
    });
    module.exports.push(export("main", ExternKind::Function, 0));

    assert_eq!(runner::run_module(&engine, &module, "main42").unwrap(), 42);
}

#[test]
fn start_function_runs_before_main() {
    let engine = InterpEngine::new();
    let mut module = ir::Module::default();
    module.types.push(FunctionType::new(vec![], vec![]));
    module.types.push(FunctionType::new(vec![], vec![Type::I32]));
    module.globals.defs.push(ir::GlobalDef {
        ty: GlobalType::new(Type::I32, Mutability::Var),
        initializer: ir::InitializerExpression::I32Const(0),
    });
    // start: global = 42
    module.functions.defs.push(ir::FunctionDef {
        type_index: 0,
        non_parameter_locals: vec![],
        code: vec![
            Operator::I32Const { value: 42 },
            Operator::GlobalSet { global_index: 0 },
            Operator::End {},
        ],
    });
    // main: return global
    module.functions.defs.push(ir::FunctionDef {
        type_index: 1,
        non_parameter_locals: vec![],
        code: vec![Operator::GlobalGet { global_index: 0 }, Operator::End {}],
    });
    module.start_function_index = Some(0);
    module.exports.push(export("main", ExternKind::Function, 1));

    assert_eq!(runner::run_module(&engine, &module, "start").unwrap(), 42);
}

#[test]
fn control_flow_evaluates() {
    // A loop that sums 1..=10, exercising block/loop/br_if and locals.
    let engine = InterpEngine::new();
    let mut module = ir::Module::default();
    module.types.push(FunctionType::new(vec![], vec![Type::I32]));
    module.functions.defs.push(ir::FunctionDef {
        type_index: 0,
        non_parameter_locals: vec![Type::I32, Type::I32],
        code: vec![
            Operator::Loop {
                block_type: ir::BlockType::Empty,
            },
            // i += 1
            Operator::LocalGet { local_index: 0 },
            Operator::I32Const { value: 1 },
            Operator::I32Add {},
            Operator::LocalSet { local_index: 0 },
            // sum += i
            Operator::LocalGet { local_index: 1 },
            Operator::LocalGet { local_index: 0 },
            Operator::I32Add {},
            Operator::LocalSet { local_index: 1 },
            // continue while i != 10
            Operator::LocalGet { local_index: 0 },
            Operator::I32Const { value: 10 },
            Operator::I32Ne {},
            Operator::BrIf { depth: 0 },
            Operator::End {},
            Operator::LocalGet { local_index: 1 },
            Operator::End {},
        ],
    });
    module.exports.push(export("main", ExternKind::Function, 0));

    assert_eq!(runner::run_module(&engine, &module, "sum").unwrap(), 55);
}

fn import_missing_module() -> ir::Module {
    let mut module = ir::Module::default();
    module.types.push(FunctionType::new(vec![], vec![]));
    module.functions.imports.push(ir::Import {
        module_name: "env".to_string(),
        export_name: "missing".to_string(),
        ty: 0,
    });
    module.functions.defs.push(ir::FunctionDef {
        type_index: 0,
        non_parameter_locals: vec![],
        code: vec![
            Operator::Call { function_index: 0 },
            Operator::End {},
        ],
    });
    module.exports.push(export("main", ExternKind::Function, 1));
    module
}

#[test]
fn linking_without_stubs_reports_missing_imports() {
    let engine = InterpEngine::new();
    let module = import_missing_module();
    let compartment = Compartment::new().unwrap();
    let mut resolver = RootResolver::new(&engine, compartment).without_stubs();

    let link_result = link_module(&module, &mut resolver);
    assert!(!link_result.success);
    assert_eq!(link_result.missing_imports.len(), 1);
    assert_eq!(link_result.missing_imports[0].module_name, "env");
    assert_eq!(link_result.missing_imports[0].export_name, "missing");
}

#[test]
fn stubbed_function_imports_trap_when_called() {
    let engine = InterpEngine::new();
    let module = import_missing_module();
    // The root resolver stubs the import with an unreachable body; linking
    // and instantiation succeed, and calling main reaches the stub.
    let error = runner::run_module(&engine, &module, "stubbed").unwrap_err();
    match error {
        RunError::Runtime(RuntimeError::Trap(trap)) => {
            assert_eq!(trap.code, TrapCode::UnreachableCodeReached);
        }
        other => panic!("expected the stub's trap, got {}", other),
    }
}

#[test]
fn invocation_checks_argument_types() {
    let engine = InterpEngine::new();
    let module = store_load_module();
    let instantiation = runner::instantiate(&engine, &module, "argcheck").unwrap();
    let load = exported_function(&instantiation, "load");

    let error =
        invoke_function_checked(&instantiation.context, load, &[Value::I64(0)]).unwrap_err();
    assert!(matches!(error, RuntimeError::IncorrectType { .. }));
    let error = invoke_function_checked(&instantiation.context, load, &[]).unwrap_err();
    assert!(matches!(error, RuntimeError::IncorrectType { .. }));
}

#[test]
fn invocation_requires_the_functions_compartment() {
    let engine = InterpEngine::new();
    let module = const_42_module();
    let instantiation = runner::instantiate(&engine, &module, "isolated").unwrap();
    let f = exported_function(&instantiation, "f");

    // A context in a different compartment must not be able to call into
    // this instance.
    let other_compartment = Compartment::new().unwrap();
    let other_context = wavelet::vm::Context::new(&other_compartment).unwrap();
    let error = invoke_function_checked(&other_context, f, &[]).unwrap_err();
    assert!(matches!(error, RuntimeError::InvalidCompartment));
}

#[test]
fn division_traps_carry_their_codes() {
    let engine = InterpEngine::new();
    let mut module = ir::Module::default();
    module
        .types
        .push(FunctionType::new(vec![Type::I32, Type::I32], vec![Type::I32]));
    module.functions.defs.push(ir::FunctionDef {
        type_index: 0,
        non_parameter_locals: vec![],
        code: vec![
            Operator::LocalGet { local_index: 0 },
            Operator::LocalGet { local_index: 1 },
            Operator::I32DivS {},
            Operator::End {},
        ],
    });
    module.exports.push(export("div", ExternKind::Function, 0));

    let instantiation = runner::instantiate(&engine, &module, "div").unwrap();
    let div = exported_function(&instantiation, "div");

    let results = invoke_function_checked(
        &instantiation.context,
        div,
        &[Value::I32(-6), Value::I32(2)],
    )
    .unwrap();
    assert_eq!(results, vec![Value::I32(-3)]);

    let error = invoke_function_checked(
        &instantiation.context,
        div,
        &[Value::I32(1), Value::I32(0)],
    )
    .unwrap_err();
    match error {
        RuntimeError::Trap(trap) => assert_eq!(trap.code, TrapCode::IntegerDivideByZero),
        other => panic!("expected a trap, got {}", other),
    }

    let error = invoke_function_checked(
        &instantiation.context,
        div,
        &[Value::I32(i32::MIN), Value::I32(-1)],
    )
    .unwrap_err();
    match error {
        RuntimeError::Trap(trap) => assert_eq!(trap.code, TrapCode::IntegerOverflow),
        other => panic!("expected a trap, got {}", other),
    }
}

#[test]
fn memory_grow_is_visible_to_wasm_and_host() {
    let engine = InterpEngine::new();
    let mut module = ir::Module::default();
    module.types.push(FunctionType::new(vec![], vec![Type::I32]));
    module.memories.defs.push(ir::MemoryDef {
        ty: MemoryType::new(1u32, Some(4), false),
    });
    module.functions.defs.push(ir::FunctionDef {
        type_index: 0,
        non_parameter_locals: vec![],
        code: vec![
            Operator::I32Const { value: 2 },
            Operator::MemoryGrow { memory_index: 0 },
            Operator::End {},
        ],
    });
    module.exports.push(export("grow2", ExternKind::Function, 0));
    module.exports.push(export("mem", ExternKind::Memory, 0));

    let instantiation = runner::instantiate(&engine, &module, "grow").unwrap();
    let grow2 = exported_function(&instantiation, "grow2");

    let results = invoke_function_checked(&instantiation.context, grow2, &[]).unwrap();
    assert_eq!(results, vec![Value::I32(1)]);

    match instantiation.instance.export("mem") {
        Some(Extern::Memory(memory)) => {
            assert_eq!(memory.num_pages(), wavelet::types::Pages(3));
        }
        other => panic!("expected a memory export, got {:?}", other),
    }
}
