//! The host's root resolver: imports are satisfied from registered named
//! instances, and anything unresolved can be stubbed so partially-linked
//! modules still instantiate.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use wavelet_ir as ir;
use wavelet_types::{ExternType, FunctionType, Type, Value};
use wavelet_vm::{
    instantiate_module, Compartment, Engine, ExceptionType, Extern, FunctionRef, Global, Memory,
    ModuleInstance, Resolver, Table,
};

/// Resolves imports against a name → instance map, generating stub objects
/// for anything the map cannot supply.
pub struct RootResolver<'e> {
    engine: &'e dyn Engine,
    compartment: Arc<Compartment>,
    module_name_to_instance: HashMap<String, Arc<ModuleInstance>>,
    generate_stubs: bool,
    // Stub function instances must outlive the resolved functions.
    stub_instances: Vec<Arc<ModuleInstance>>,
    stub_objects: Vec<Extern>,
}

impl<'e> RootResolver<'e> {
    /// Creates a resolver for `compartment` that generates stubs for
    /// unresolved imports.
    pub fn new(engine: &'e dyn Engine, compartment: Arc<Compartment>) -> Self {
        Self {
            engine,
            compartment,
            module_name_to_instance: HashMap::new(),
            generate_stubs: true,
            stub_instances: Vec::new(),
            stub_objects: Vec::new(),
        }
    }

    /// Disables stub generation: unresolved imports stay missing.
    pub fn without_stubs(mut self) -> Self {
        self.generate_stubs = false;
        self
    }

    /// Registers an instance whose exports satisfy imports from
    /// `module_name`.
    pub fn register(&mut self, module_name: impl Into<String>, instance: Arc<ModuleInstance>) {
        self.module_name_to_instance
            .insert(module_name.into(), instance);
    }

    fn stub_function(&mut self, export_name: &str, ty: &FunctionType) -> Option<FunctionRef> {
        // Generate a module whose single function faults if called, and run
        // it through the regular compile/instantiate pipeline.
        let mut stub_module = ir::Module::default();
        stub_module.types.push(ty.clone());
        stub_module.functions.defs.push(ir::FunctionDef {
            type_index: 0,
            non_parameter_locals: vec![],
            code: vec![
                ir::Operator::Unreachable {},
                ir::Operator::End {},
            ],
        });
        stub_module.exports.push(ir::Export {
            name: "importStub".to_string(),
            kind: wavelet_types::ExternKind::Function,
            index: 0,
        });
        if let Err(error) = ir::validate::validate_module(&stub_module) {
            warn!(%error, "generated stub module failed validation");
            return None;
        }

        let compiled = match wavelet_vm::compile_module(self.engine, &stub_module) {
            Ok(compiled) => compiled,
            Err(error) => {
                warn!(%error, "failed to compile stub module");
                return None;
            }
        };
        let instance = match instantiate_module(
            self.engine,
            &self.compartment,
            &compiled,
            Default::default(),
            format!("importStub: {}", export_name),
        ) {
            Ok(instance) => instance,
            Err(error) => {
                warn!(%error, "failed to instantiate stub module");
                return None;
            }
        };

        let function = match instance.export("importStub") {
            Some(Extern::Function(function)) => function,
            _ => return None,
        };
        self.stub_instances.push(instance);
        Some(function)
    }

    fn typed_zero(ty: Type) -> Value<FunctionRef> {
        match ty {
            Type::I32 => Value::I32(0),
            Type::I64 => Value::I64(0),
            Type::F32 => Value::F32(0.0),
            Type::F64 => Value::F64(0.0),
            Type::V128 => Value::V128(0),
            Type::FuncRef | Type::ExternRef => Value::FuncRef(None),
        }
    }

    /// Releases the stub objects this resolver generated. An instance
    /// linked against stub functions is only safe to call while the stub
    /// instances are alive, so callers that outlive the resolver must hold
    /// on to these.
    pub fn into_stubs(self) -> (Vec<Arc<ModuleInstance>>, Vec<Extern>) {
        (self.stub_instances, self.stub_objects)
    }

    fn stub_object(&mut self, export_name: &str, ty: &ExternType) -> Option<Extern> {
        let object = match ty {
            ExternType::Function(function_type) => {
                Extern::Function(self.stub_function(export_name, function_type)?)
            }
            ExternType::Memory(memory_type) => Extern::Memory(
                Memory::new(&self.compartment, *memory_type, export_name.to_string()).ok()?,
            ),
            ExternType::Table(table_type) => Extern::Table(
                Table::new(&self.compartment, *table_type, export_name.to_string()).ok()?,
            ),
            ExternType::Global(global_type) => Extern::Global(
                Global::new(
                    &self.compartment,
                    *global_type,
                    Self::typed_zero(global_type.ty),
                )
                .ok()?,
            ),
            ExternType::Exception(sig) => Extern::ExceptionType(
                ExceptionType::new(&self.compartment, sig.clone(), export_name.to_string())
                    .ok()?,
            ),
        };
        self.stub_objects.push(object.clone());
        Some(object)
    }
}

impl Resolver for RootResolver<'_> {
    fn resolve(
        &mut self,
        module_name: &str,
        export_name: &str,
        ty: &ExternType,
    ) -> Option<Extern> {
        if let Some(instance) = self.module_name_to_instance.get(module_name) {
            if let Some(object) = instance.export(export_name) {
                if object.is_a(ty) {
                    return Some(object);
                }
                debug!(
                    module_name,
                    export_name,
                    expected = %ty,
                    actual = %object.ty(),
                    "resolved import to an object of the wrong type"
                );
                return None;
            }
        }

        if self.generate_stubs {
            debug!(module_name, export_name, expected = %ty, "stubbing import");
            return self.stub_object(export_name, ty);
        }
        None
    }
}
