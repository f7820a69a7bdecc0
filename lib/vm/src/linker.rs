//! The linking protocol: resolving a module's declared imports against a
//! resolver capability before instantiation.

use crate::instance::ImportBindings;
use crate::object::Extern;
use tracing::debug;
use wavelet_ir as ir;
use wavelet_types::ExternType;

/// Maps `(module name, export name, declared type)` triples to objects.
pub trait Resolver {
    /// Resolves one import, or reports it unresolvable with `None`.
    fn resolve(
        &mut self,
        module_name: &str,
        export_name: &str,
        ty: &ExternType,
    ) -> Option<Extern>;
}

/// An import the resolver could not supply.
#[derive(Clone, Debug)]
pub struct MissingImport {
    /// The import's module name.
    pub module_name: String,
    /// The import's export name.
    pub export_name: String,
    /// The type the import declares.
    pub ty: ExternType,
}

/// The outcome of linking: the resolved bindings, the imports that could
/// not be resolved, and whether the result is usable for instantiation.
pub struct LinkResult {
    /// Imports the resolver could not supply, in declaration order.
    pub missing_imports: Vec<MissingImport>,
    /// The resolved bindings, ready for instantiation.
    pub resolved_imports: ImportBindings,
    /// True iff nothing is missing and every resolved object satisfies its
    /// declared type.
    pub success: bool,
}

/// Links a module: enumerates its imports in declaration order, resolves
/// each through `resolver`, and type-checks every resolution.
pub fn link_module(module: &ir::Module, resolver: &mut dyn Resolver) -> LinkResult {
    let mut result = LinkResult {
        missing_imports: Vec::new(),
        resolved_imports: ImportBindings::default(),
        success: true,
    };

    fn link_one(
        result: &mut LinkResult,
        resolver: &mut dyn Resolver,
        module_name: &str,
        export_name: &str,
        ty: ExternType,
    ) -> Option<Extern> {
        match resolver.resolve(module_name, export_name, &ty) {
            Some(object) => {
                if !object.is_a(&ty) {
                    debug!(
                        module_name,
                        export_name,
                        expected = %ty,
                        actual = %object.ty(),
                        "import resolved to an object of the wrong type"
                    );
                    result.success = false;
                }
                Some(object)
            }
            None => {
                result.missing_imports.push(MissingImport {
                    module_name: module_name.to_string(),
                    export_name: export_name.to_string(),
                    ty,
                });
                result.success = false;
                None
            }
        }
    }

    for import in &module.functions.imports {
        let ty = module
            .types
            .get(import.ty as usize)
            .cloned()
            .unwrap_or_default();
        if let Some(Extern::Function(function)) = link_one(
            &mut result,
            resolver,
            &import.module_name,
            &import.export_name,
            ExternType::Function(ty),
        ) {
            result.resolved_imports.functions.push(function);
        }
    }
    for import in &module.tables.imports {
        if let Some(Extern::Table(table)) = link_one(
            &mut result,
            resolver,
            &import.module_name,
            &import.export_name,
            ExternType::Table(import.ty),
        ) {
            result.resolved_imports.tables.push(table);
        }
    }
    for import in &module.memories.imports {
        if let Some(Extern::Memory(memory)) = link_one(
            &mut result,
            resolver,
            &import.module_name,
            &import.export_name,
            ExternType::Memory(import.ty),
        ) {
            result.resolved_imports.memories.push(memory);
        }
    }
    for import in &module.globals.imports {
        if let Some(Extern::Global(global)) = link_one(
            &mut result,
            resolver,
            &import.module_name,
            &import.export_name,
            ExternType::Global(import.ty),
        ) {
            result.resolved_imports.globals.push(global);
        }
    }
    for import in &module.exception_types.imports {
        if let Some(Extern::ExceptionType(exception_type)) = link_one(
            &mut result,
            resolver,
            &import.module_name,
            &import.export_name,
            ExternType::Exception(import.ty.clone()),
        ) {
            result.resolved_imports.exception_types.push(exception_type);
        }
    }

    result
}
