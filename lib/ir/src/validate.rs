//! Module and code validation.
//!
//! Validation is split the way a streaming consumer of the binary format
//! needs it: [`validate_pre_code_sections`] runs over everything declared
//! before the code section, [`CodeValidator`] checks one function body
//! operator by operator, and [`validate_post_code_sections`] runs the checks
//! that must wait for the data section (which follows code), fed by the
//! [`DeferredCodeValidationState`] the code pass accumulated.

use crate::module::{InitializerExpression, Module};
use crate::operators::{BlockType, Operator};
use crate::MAX_CALL_VALUES;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tracing::trace;
use wavelet_types::{ExternKind, Pages, Type};

/// The single failure kind every validation pass surfaces.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    /// What was wrong, in terms of the module's declarations.
    pub message: String,
}

impl ValidationError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

macro_rules! invalid {
    ($($arg:tt)*) => {
        return Err(ValidationError::new(format!($($arg)*)))
    };
}

/// Since the data section occurs after the code section in binary modules,
/// some validation must be deferred until it is loaded. The code pass
/// records the highest data-segment index referenced by `memory.init` and
/// `data.drop` here.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeferredCodeValidationState {
    /// One past the largest data-segment index referenced by the code.
    pub required_num_data_segments: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Operand {
    Type(Type),
    /// The placeholder popped while control is statically unreachable.
    Unknown,
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Type(ty) => write!(f, "{}", ty),
            Self::Unknown => write!(f, "<unknown>"),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ControlKind {
    Block,
    Loop,
    IfThen,
    IfElse,
    Try,
    Catch,
}

struct ControlFrame {
    kind: ControlKind,
    params: Vec<Type>,
    results: Vec<Type>,
    /// Operand-stack height at frame entry, before the frame's parameters
    /// were re-pushed for the body.
    height: usize,
    unreachable: bool,
}

impl ControlFrame {
    /// The types a branch to this frame's label must provide: a loop's label
    /// is its head, everything else's is its end.
    fn label_types(&self) -> &[Type] {
        match self.kind {
            ControlKind::Loop => &self.params,
            _ => &self.results,
        }
    }
}

/// Validates a single function's operator sequence in order.
pub struct CodeValidator<'m> {
    module: &'m Module,
    locals: Vec<Type>,
    operands: SmallVec<[Operand; 32]>,
    control: SmallVec<[ControlFrame; 8]>,
    deferred: &'m mut DeferredCodeValidationState,
}

impl<'m> CodeValidator<'m> {
    /// Creates a validator for `function_def` within `module`.
    pub fn new(
        module: &'m Module,
        function_def: &crate::module::FunctionDef,
        deferred: &'m mut DeferredCodeValidationState,
    ) -> Result<Self, ValidationError> {
        let function_type = match module.types.get(function_def.type_index as usize) {
            Some(ty) => ty,
            None => invalid!(
                "function type index {} is out of range (module has {} types)",
                function_def.type_index,
                module.types.len()
            ),
        };

        let mut locals = function_type.params().to_vec();
        locals.extend_from_slice(&function_def.non_parameter_locals);

        let mut validator = Self {
            module,
            locals,
            operands: SmallVec::new(),
            control: SmallVec::new(),
            deferred,
        };
        validator.push_control(
            ControlKind::Block,
            Vec::new(),
            function_type.results().to_vec(),
        );
        Ok(validator)
    }

    fn push_operand(&mut self, operand: Operand) {
        self.operands.push(operand);
    }

    fn push_operand_types(&mut self, types: &[Type]) {
        for &ty in types {
            self.operands.push(Operand::Type(ty));
        }
    }

    fn pop_operand(&mut self) -> Result<Operand, ValidationError> {
        let frame = match self.control.last() {
            Some(frame) => frame,
            None => invalid!("operator occurs after the function's final end"),
        };
        if self.operands.len() == frame.height {
            if frame.unreachable {
                return Ok(Operand::Unknown);
            }
            invalid!("operand stack underflow");
        }
        Ok(self.operands.pop().unwrap())
    }

    fn pop_expected(&mut self, expected: Type) -> Result<Operand, ValidationError> {
        let actual = self.pop_operand()?;
        if let Operand::Type(ty) = actual {
            if ty != expected {
                invalid!("type mismatch: expected {}, got {}", expected, ty);
            }
        }
        Ok(actual)
    }

    fn pop_expecteds(&mut self, expected: &[Type]) -> Result<(), ValidationError> {
        for &ty in expected.iter().rev() {
            self.pop_expected(ty)?;
        }
        Ok(())
    }

    fn push_control(&mut self, kind: ControlKind, params: Vec<Type>, results: Vec<Type>) {
        let height = self.operands.len();
        self.push_operand_types(&params);
        self.control.push(ControlFrame {
            kind,
            params,
            results,
            height,
            unreachable: false,
        });
    }

    fn pop_control(&mut self) -> Result<ControlFrame, ValidationError> {
        let (results, height) = match self.control.last() {
            Some(frame) => (frame.results.clone(), frame.height),
            None => invalid!("mismatched end: no control frame to close"),
        };
        self.pop_expecteds(&results)?;
        if self.operands.len() != height {
            invalid!(
                "type mismatch: {} superfluous operand(s) at end of block",
                self.operands.len() - height
            );
        }
        Ok(self.control.pop().unwrap())
    }

    fn set_unreachable(&mut self) {
        let frame = self.control.last_mut().unwrap();
        self.operands.truncate(frame.height);
        frame.unreachable = true;
    }

    fn frame_at_depth(&self, depth: u32) -> Result<&ControlFrame, ValidationError> {
        let depth = depth as usize;
        if depth >= self.control.len() {
            invalid!(
                "branch depth {} exceeds the control stack depth {}",
                depth,
                self.control.len()
            );
        }
        Ok(&self.control[self.control.len() - 1 - depth])
    }

    fn block_signature(
        &self,
        block_type: BlockType,
    ) -> Result<(Vec<Type>, Vec<Type>), ValidationError> {
        match block_type {
            BlockType::Empty => Ok((Vec::new(), Vec::new())),
            BlockType::Value(ty) => Ok((Vec::new(), vec![ty])),
            BlockType::Func(type_index) => match self.module.types.get(type_index as usize) {
                Some(ty) => Ok((ty.params().to_vec(), ty.results().to_vec())),
                None => invalid!("block type index {} is out of range", type_index),
            },
        }
    }

    fn local_type(&self, local_index: u32) -> Result<Type, ValidationError> {
        match self.locals.get(local_index as usize) {
            Some(&ty) => Ok(ty),
            None => invalid!(
                "local index {} is out of range (function has {} locals)",
                local_index,
                self.locals.len()
            ),
        }
    }

    fn check_memory(&self, memory_index: u32) -> Result<(), ValidationError> {
        if (memory_index as usize) >= self.module.memories.size() {
            invalid!("memory index {} is out of range", memory_index);
        }
        Ok(())
    }

    fn load(
        &mut self,
        natural_alignment_log2: u32,
        align: u32,
        result: Type,
    ) -> Result<(), ValidationError> {
        self.check_memory(0)?;
        if align > natural_alignment_log2 {
            invalid!(
                "alignment 2^{} exceeds the access's natural alignment 2^{}",
                align,
                natural_alignment_log2
            );
        }
        self.pop_expected(Type::I32)?;
        self.push_operand(Operand::Type(result));
        Ok(())
    }

    fn store(
        &mut self,
        natural_alignment_log2: u32,
        align: u32,
        value: Type,
    ) -> Result<(), ValidationError> {
        self.check_memory(0)?;
        if align > natural_alignment_log2 {
            invalid!(
                "alignment 2^{} exceeds the access's natural alignment 2^{}",
                align,
                natural_alignment_log2
            );
        }
        self.pop_expected(value)?;
        self.pop_expected(Type::I32)?;
        Ok(())
    }

    fn test_op(&mut self, ty: Type) -> Result<(), ValidationError> {
        self.pop_expected(ty)?;
        self.push_operand(Operand::Type(Type::I32));
        Ok(())
    }

    fn compare_op(&mut self, ty: Type) -> Result<(), ValidationError> {
        self.pop_expected(ty)?;
        self.pop_expected(ty)?;
        self.push_operand(Operand::Type(Type::I32));
        Ok(())
    }

    fn unary_op(&mut self, ty: Type) -> Result<(), ValidationError> {
        self.pop_expected(ty)?;
        self.push_operand(Operand::Type(ty));
        Ok(())
    }

    fn binary_op(&mut self, ty: Type) -> Result<(), ValidationError> {
        self.pop_expected(ty)?;
        self.pop_expected(ty)?;
        self.push_operand(Operand::Type(ty));
        Ok(())
    }

    fn conversion_op(&mut self, from: Type, to: Type) -> Result<(), ValidationError> {
        self.pop_expected(from)?;
        self.push_operand(Operand::Type(to));
        Ok(())
    }

    /// Type-checks one operator: pops its declared argument types, pushes
    /// its declared result types, and maintains the control-frame stack.
    pub fn operator(&mut self, op: &Operator) -> Result<(), ValidationError> {
        use Operator as Op;
        match op {
            Op::Unreachable {} => self.set_unreachable(),
            Op::Nop {} => {}

            Op::Block { block_type } => {
                let (params, results) = self.block_signature(*block_type)?;
                self.pop_expecteds(&params)?;
                self.push_control(ControlKind::Block, params, results);
            }
            Op::Loop { block_type } => {
                let (params, results) = self.block_signature(*block_type)?;
                self.pop_expecteds(&params)?;
                self.push_control(ControlKind::Loop, params, results);
            }
            Op::If { block_type } => {
                let (params, results) = self.block_signature(*block_type)?;
                self.pop_expected(Type::I32)?;
                self.pop_expecteds(&params)?;
                self.push_control(ControlKind::IfThen, params, results);
            }
            Op::Else {} => {
                let frame = self.pop_control()?;
                if frame.kind != ControlKind::IfThen {
                    invalid!("else may only close an if");
                }
                self.push_control(ControlKind::IfElse, frame.params, frame.results);
            }
            Op::End {} => {
                let frame = self.pop_control()?;
                if frame.kind == ControlKind::IfThen && frame.params != frame.results {
                    invalid!("if without else requires matching parameter and result types");
                }
                let results = frame.results;
                self.push_operand_types(&results);
            }

            Op::Br { depth } => {
                let label_types = self.frame_at_depth(*depth)?.label_types().to_vec();
                self.pop_expecteds(&label_types)?;
                self.set_unreachable();
            }
            Op::BrIf { depth } => {
                self.pop_expected(Type::I32)?;
                let label_types = self.frame_at_depth(*depth)?.label_types().to_vec();
                self.pop_expecteds(&label_types)?;
                self.push_operand_types(&label_types);
            }
            Op::BrTable { targets, default } => {
                self.pop_expected(Type::I32)?;
                let default_types = self.frame_at_depth(*default)?.label_types().to_vec();
                for &target in targets {
                    let target_types = self.frame_at_depth(target)?.label_types();
                    if target_types != default_types.as_slice() {
                        invalid!(
                            "br_table target at depth {} disagrees with the default label types",
                            target
                        );
                    }
                }
                self.pop_expecteds(&default_types)?;
                self.set_unreachable();
            }
            Op::Return {} => {
                let results = self.control[0].results.clone();
                self.pop_expecteds(&results)?;
                self.set_unreachable();
            }

            Op::Call { function_index } => {
                let ty = match self.module.function_type(*function_index) {
                    Some(ty) => ty.clone(),
                    None => invalid!("function index {} is out of range", function_index),
                };
                self.pop_expecteds(ty.params())?;
                self.push_operand_types(ty.results());
            }
            Op::CallIndirect {
                type_index,
                table_index,
            } => {
                let table_type = match self.module.table_type(*table_index) {
                    Some(ty) => ty,
                    None => invalid!("table index {} is out of range", table_index),
                };
                if table_type.ty != Type::FuncRef {
                    invalid!("call_indirect requires a funcref table");
                }
                let ty = match self.module.types.get(*type_index as usize) {
                    Some(ty) => ty.clone(),
                    None => invalid!("type index {} is out of range", type_index),
                };
                self.pop_expected(Type::I32)?;
                self.pop_expecteds(ty.params())?;
                self.push_operand_types(ty.results());
            }

            Op::Try { block_type } => {
                let (params, results) = self.block_signature(*block_type)?;
                self.pop_expecteds(&params)?;
                self.push_control(ControlKind::Try, params, results);
            }
            Op::Catch {
                exception_type_index,
            } => {
                let sig = match self.module.exception_sig(*exception_type_index) {
                    Some(sig) => sig.clone(),
                    None => invalid!(
                        "exception type index {} is out of range",
                        exception_type_index
                    ),
                };
                let frame = self.pop_control()?;
                if !matches!(frame.kind, ControlKind::Try | ControlKind::Catch) {
                    invalid!("catch may only follow a try or another catch");
                }
                self.push_control(ControlKind::Catch, sig.params.to_vec(), frame.results);
            }
            Op::CatchAll {} => {
                let frame = self.pop_control()?;
                if !matches!(frame.kind, ControlKind::Try | ControlKind::Catch) {
                    invalid!("catch_all may only follow a try or a catch");
                }
                self.push_control(ControlKind::Catch, Vec::new(), frame.results);
            }
            Op::Throw {
                exception_type_index,
            } => {
                let sig = match self.module.exception_sig(*exception_type_index) {
                    Some(sig) => sig.clone(),
                    None => invalid!(
                        "exception type index {} is out of range",
                        exception_type_index
                    ),
                };
                self.pop_expecteds(&sig.params)?;
                self.set_unreachable();
            }

            Op::Drop {} => {
                self.pop_operand()?;
            }
            Op::Select {} => {
                self.pop_expected(Type::I32)?;
                let first = self.pop_operand()?;
                let second = self.pop_operand()?;
                let result = match (first, second) {
                    (Operand::Type(a), Operand::Type(b)) => {
                        if a != b {
                            invalid!("select operands disagree: {} vs {}", a, b);
                        }
                        Operand::Type(a)
                    }
                    (Operand::Type(a), Operand::Unknown) => Operand::Type(a),
                    (Operand::Unknown, other) => other,
                };
                if let Operand::Type(ty) = result {
                    if ty.is_ref() {
                        invalid!("select may not be used with reference types");
                    }
                }
                self.push_operand(result);
            }

            Op::LocalGet { local_index } => {
                let ty = self.local_type(*local_index)?;
                self.push_operand(Operand::Type(ty));
            }
            Op::LocalSet { local_index } => {
                let ty = self.local_type(*local_index)?;
                self.pop_expected(ty)?;
            }
            Op::LocalTee { local_index } => {
                let ty = self.local_type(*local_index)?;
                self.pop_expected(ty)?;
                self.push_operand(Operand::Type(ty));
            }
            Op::GlobalGet { global_index } => {
                let ty = match self.module.global_type(*global_index) {
                    Some(ty) => ty,
                    None => invalid!("global index {} is out of range", global_index),
                };
                self.push_operand(Operand::Type(ty.ty));
            }
            Op::GlobalSet { global_index } => {
                let ty = match self.module.global_type(*global_index) {
                    Some(ty) => ty,
                    None => invalid!("global index {} is out of range", global_index),
                };
                if !ty.mutability.is_mutable() {
                    invalid!("global {} is immutable", global_index);
                }
                self.pop_expected(ty.ty)?;
            }

            Op::I32Load { align, .. } => self.load(2, *align, Type::I32)?,
            Op::I64Load { align, .. } => self.load(3, *align, Type::I64)?,
            Op::F32Load { align, .. } => self.load(2, *align, Type::F32)?,
            Op::F64Load { align, .. } => self.load(3, *align, Type::F64)?,
            Op::I32Load8S { align, .. } | Op::I32Load8U { align, .. } => {
                self.load(0, *align, Type::I32)?
            }
            Op::I32Load16S { align, .. } | Op::I32Load16U { align, .. } => {
                self.load(1, *align, Type::I32)?
            }
            Op::I64Load8S { align, .. } | Op::I64Load8U { align, .. } => {
                self.load(0, *align, Type::I64)?
            }
            Op::I64Load16S { align, .. } | Op::I64Load16U { align, .. } => {
                self.load(1, *align, Type::I64)?
            }
            Op::I64Load32S { align, .. } | Op::I64Load32U { align, .. } => {
                self.load(2, *align, Type::I64)?
            }
            Op::I32Store { align, .. } => self.store(2, *align, Type::I32)?,
            Op::I64Store { align, .. } => self.store(3, *align, Type::I64)?,
            Op::F32Store { align, .. } => self.store(2, *align, Type::F32)?,
            Op::F64Store { align, .. } => self.store(3, *align, Type::F64)?,
            Op::I32Store8 { align, .. } => self.store(0, *align, Type::I32)?,
            Op::I32Store16 { align, .. } => self.store(1, *align, Type::I32)?,
            Op::I64Store8 { align, .. } => self.store(0, *align, Type::I64)?,
            Op::I64Store16 { align, .. } => self.store(1, *align, Type::I64)?,
            Op::I64Store32 { align, .. } => self.store(2, *align, Type::I64)?,

            Op::MemorySize { memory_index } => {
                self.check_memory(*memory_index)?;
                self.push_operand(Operand::Type(Type::I32));
            }
            Op::MemoryGrow { memory_index } => {
                self.check_memory(*memory_index)?;
                self.pop_expected(Type::I32)?;
                self.push_operand(Operand::Type(Type::I32));
            }
            Op::MemoryInit {
                data_index,
                memory_index,
            } => {
                self.check_memory(*memory_index)?;
                self.deferred.required_num_data_segments = self
                    .deferred
                    .required_num_data_segments
                    .max(*data_index as usize + 1);
                self.pop_expected(Type::I32)?;
                self.pop_expected(Type::I32)?;
                self.pop_expected(Type::I32)?;
            }
            Op::DataDrop { data_index } => {
                self.deferred.required_num_data_segments = self
                    .deferred
                    .required_num_data_segments
                    .max(*data_index as usize + 1);
            }
            Op::MemoryCopy {
                dst_memory_index,
                src_memory_index,
            } => {
                self.check_memory(*dst_memory_index)?;
                self.check_memory(*src_memory_index)?;
                self.pop_expected(Type::I32)?;
                self.pop_expected(Type::I32)?;
                self.pop_expected(Type::I32)?;
            }
            Op::MemoryFill { memory_index } => {
                self.check_memory(*memory_index)?;
                self.pop_expected(Type::I32)?;
                self.pop_expected(Type::I32)?;
                self.pop_expected(Type::I32)?;
            }

            Op::I32Const { .. } => self.push_operand(Operand::Type(Type::I32)),
            Op::I64Const { .. } => self.push_operand(Operand::Type(Type::I64)),
            Op::F32Const { .. } => self.push_operand(Operand::Type(Type::F32)),
            Op::F64Const { .. } => self.push_operand(Operand::Type(Type::F64)),
            Op::V128Const { .. } => self.push_operand(Operand::Type(Type::V128)),

            Op::I32Eqz {} => self.test_op(Type::I32)?,
            Op::I64Eqz {} => self.test_op(Type::I64)?,

            Op::I32Eq {}
            | Op::I32Ne {}
            | Op::I32LtS {}
            | Op::I32LtU {}
            | Op::I32GtS {}
            | Op::I32GtU {}
            | Op::I32LeS {}
            | Op::I32LeU {}
            | Op::I32GeS {}
            | Op::I32GeU {} => self.compare_op(Type::I32)?,
            Op::I64Eq {}
            | Op::I64Ne {}
            | Op::I64LtS {}
            | Op::I64LtU {}
            | Op::I64GtS {}
            | Op::I64GtU {}
            | Op::I64LeS {}
            | Op::I64LeU {}
            | Op::I64GeS {}
            | Op::I64GeU {} => self.compare_op(Type::I64)?,
            Op::F32Eq {} | Op::F32Ne {} | Op::F32Lt {} | Op::F32Gt {} | Op::F32Le {}
            | Op::F32Ge {} => self.compare_op(Type::F32)?,
            Op::F64Eq {} | Op::F64Ne {} | Op::F64Lt {} | Op::F64Gt {} | Op::F64Le {}
            | Op::F64Ge {} => self.compare_op(Type::F64)?,

            Op::I32Clz {} | Op::I32Ctz {} | Op::I32Popcnt {} | Op::I32Extend8S {}
            | Op::I32Extend16S {} => self.unary_op(Type::I32)?,
            Op::I64Clz {} | Op::I64Ctz {} | Op::I64Popcnt {} | Op::I64Extend8S {}
            | Op::I64Extend16S {} | Op::I64Extend32S {} => self.unary_op(Type::I64)?,

            Op::I32Add {}
            | Op::I32Sub {}
            | Op::I32Mul {}
            | Op::I32DivS {}
            | Op::I32DivU {}
            | Op::I32RemS {}
            | Op::I32RemU {}
            | Op::I32And {}
            | Op::I32Or {}
            | Op::I32Xor {}
            | Op::I32Shl {}
            | Op::I32ShrS {}
            | Op::I32ShrU {}
            | Op::I32Rotl {}
            | Op::I32Rotr {} => self.binary_op(Type::I32)?,
            Op::I64Add {}
            | Op::I64Sub {}
            | Op::I64Mul {}
            | Op::I64DivS {}
            | Op::I64DivU {}
            | Op::I64RemS {}
            | Op::I64RemU {}
            | Op::I64And {}
            | Op::I64Or {}
            | Op::I64Xor {}
            | Op::I64Shl {}
            | Op::I64ShrS {}
            | Op::I64ShrU {}
            | Op::I64Rotl {}
            | Op::I64Rotr {} => self.binary_op(Type::I64)?,

            Op::F32Abs {} | Op::F32Neg {} | Op::F32Ceil {} | Op::F32Floor {} | Op::F32Trunc {}
            | Op::F32Nearest {} | Op::F32Sqrt {} => self.unary_op(Type::F32)?,
            Op::F64Abs {} | Op::F64Neg {} | Op::F64Ceil {} | Op::F64Floor {} | Op::F64Trunc {}
            | Op::F64Nearest {} | Op::F64Sqrt {} => self.unary_op(Type::F64)?,
            Op::F32Add {} | Op::F32Sub {} | Op::F32Mul {} | Op::F32Div {} | Op::F32Min {}
            | Op::F32Max {} | Op::F32Copysign {} => self.binary_op(Type::F32)?,
            Op::F64Add {} | Op::F64Sub {} | Op::F64Mul {} | Op::F64Div {} | Op::F64Min {}
            | Op::F64Max {} | Op::F64Copysign {} => self.binary_op(Type::F64)?,

            Op::I32WrapI64 {} => self.conversion_op(Type::I64, Type::I32)?,
            Op::I32TruncF32S {} | Op::I32TruncF32U {} | Op::I32TruncSatF32S {}
            | Op::I32TruncSatF32U {} | Op::I32ReinterpretF32 {} => {
                self.conversion_op(Type::F32, Type::I32)?
            }
            Op::I32TruncF64S {} | Op::I32TruncF64U {} | Op::I32TruncSatF64S {}
            | Op::I32TruncSatF64U {} => self.conversion_op(Type::F64, Type::I32)?,
            Op::I64ExtendI32S {} | Op::I64ExtendI32U {} => {
                self.conversion_op(Type::I32, Type::I64)?
            }
            Op::I64TruncF32S {} | Op::I64TruncF32U {} | Op::I64TruncSatF32S {}
            | Op::I64TruncSatF32U {} => self.conversion_op(Type::F32, Type::I64)?,
            Op::I64TruncF64S {} | Op::I64TruncF64U {} | Op::I64TruncSatF64S {}
            | Op::I64TruncSatF64U {} | Op::I64ReinterpretF64 {} => {
                self.conversion_op(Type::F64, Type::I64)?
            }
            Op::F32ConvertI32S {} | Op::F32ConvertI32U {} | Op::F32ReinterpretI32 {} => {
                self.conversion_op(Type::I32, Type::F32)?
            }
            Op::F32ConvertI64S {} | Op::F32ConvertI64U {} => {
                self.conversion_op(Type::I64, Type::F32)?
            }
            Op::F32DemoteF64 {} => self.conversion_op(Type::F64, Type::F32)?,
            Op::F64ConvertI32S {} | Op::F64ConvertI32U {} => {
                self.conversion_op(Type::I32, Type::F64)?
            }
            Op::F64ConvertI64S {} | Op::F64ConvertI64U {} | Op::F64ReinterpretI64 {} => {
                self.conversion_op(Type::I64, Type::F64)?
            }
            Op::F64PromoteF32 {} => self.conversion_op(Type::F32, Type::F64)?,
        }
        Ok(())
    }

    /// Checks that the operator sequence closed every control frame.
    pub fn finish(self) -> Result<(), ValidationError> {
        if !self.control.is_empty() {
            invalid!(
                "function body ended with {} unclosed control frame(s)",
                self.control.len()
            );
        }
        Ok(())
    }
}

fn validate_initializer(
    module: &Module,
    expression: &InitializerExpression,
    expected: Type,
    num_visible_globals: usize,
) -> Result<(), ValidationError> {
    let actual = match expression {
        InitializerExpression::I32Const(_) => Type::I32,
        InitializerExpression::I64Const(_) => Type::I64,
        InitializerExpression::F32Const(_) => Type::F32,
        InitializerExpression::F64Const(_) => Type::F64,
        InitializerExpression::V128Const(_) => Type::V128,
        InitializerExpression::RefNull => {
            if !expected.is_ref() {
                invalid!("ref.null initializer for non-reference type {}", expected);
            }
            return Ok(());
        }
        InitializerExpression::GlobalGet(global_index) => {
            if (*global_index as usize) >= num_visible_globals {
                invalid!(
                    "initializer references global {} before its declaration",
                    global_index
                );
            }
            let ty = module.global_type(*global_index).unwrap();
            if ty.mutability.is_mutable() {
                invalid!("initializer references mutable global {}", global_index);
            }
            ty.ty
        }
    };
    if actual != expected {
        invalid!("initializer type mismatch: expected {}, got {}", expected, actual);
    }
    Ok(())
}

/// Validates the type section: value types are unconstrained, but every
/// signature must fit the runtime's call scratch area.
pub fn validate_types(module: &Module) -> Result<(), ValidationError> {
    for (index, ty) in module.types.iter().enumerate() {
        if ty.params().len() > MAX_CALL_VALUES || ty.results().len() > MAX_CALL_VALUES {
            invalid!(
                "type {} has more than {} parameters or results",
                index,
                MAX_CALL_VALUES
            );
        }
    }
    Ok(())
}

fn validate_table_type(ty: &wavelet_types::TableType) -> Result<(), ValidationError> {
    if ty.ty != Type::FuncRef {
        invalid!("table element type must be funcref");
    }
    if let Some(maximum) = ty.maximum {
        if maximum < ty.minimum {
            invalid!("table maximum {} is below its minimum {}", maximum, ty.minimum);
        }
    }
    Ok(())
}

fn validate_memory_type(ty: &wavelet_types::MemoryType) -> Result<(), ValidationError> {
    if ty.minimum > Pages::max_value() {
        invalid!("memory minimum {:?} exceeds the 32-bit address space", ty.minimum);
    }
    if let Some(maximum) = ty.maximum {
        if maximum > Pages::max_value() {
            invalid!("memory maximum {:?} exceeds the 32-bit address space", maximum);
        }
        if maximum < ty.minimum {
            invalid!(
                "memory maximum {:?} is below its minimum {:?}",
                maximum,
                ty.minimum
            );
        }
    } else if ty.shared {
        invalid!("shared memories require a declared maximum");
    }
    Ok(())
}

/// Validates the import section.
pub fn validate_imports(module: &Module) -> Result<(), ValidationError> {
    for import in &module.functions.imports {
        if (import.ty as usize) >= module.types.len() {
            invalid!(
                "import {}.{} references type {} which is out of range",
                import.module_name,
                import.export_name,
                import.ty
            );
        }
    }
    for import in &module.tables.imports {
        validate_table_type(&import.ty)?;
    }
    for import in &module.memories.imports {
        validate_memory_type(&import.ty)?;
    }
    Ok(())
}

/// Validates that every function definition declares a known type.
pub fn validate_function_declarations(module: &Module) -> Result<(), ValidationError> {
    for (index, def) in module.functions.defs.iter().enumerate() {
        if (def.type_index as usize) >= module.types.len() {
            invalid!(
                "function {} declares type {} which is out of range",
                module.functions.imports.len() + index,
                def.type_index
            );
        }
    }
    Ok(())
}

/// Validates the table section.
pub fn validate_table_defs(module: &Module) -> Result<(), ValidationError> {
    for def in &module.tables.defs {
        validate_table_type(&def.ty)?;
    }
    Ok(())
}

/// Validates the memory section.
pub fn validate_memory_defs(module: &Module) -> Result<(), ValidationError> {
    for def in &module.memories.defs {
        validate_memory_type(&def.ty)?;
    }
    Ok(())
}

/// Validates global definitions and their initializers. An initializer may
/// only read globals declared before it.
pub fn validate_global_defs(module: &Module) -> Result<(), ValidationError> {
    for (def_index, def) in module.globals.defs.iter().enumerate() {
        validate_initializer(
            module,
            &def.initializer,
            def.ty.ty,
            module.globals.imports.len() + def_index,
        )?;
    }
    Ok(())
}

/// Validates exception-type definitions.
pub fn validate_exception_type_defs(module: &Module) -> Result<(), ValidationError> {
    for def in &module.exception_types.defs {
        if def.sig.params.len() > MAX_CALL_VALUES {
            invalid!("exception payload exceeds {} values", MAX_CALL_VALUES);
        }
    }
    Ok(())
}

/// Validates the export section: names must be unique and indices in range.
pub fn validate_exports(module: &Module) -> Result<(), ValidationError> {
    let mut names: HashSet<&str> = HashSet::new();
    for export in &module.exports {
        if !names.insert(&export.name) {
            invalid!("duplicate export name {:?}", export.name);
        }
        let space_size = match export.kind {
            ExternKind::Function => module.functions.size(),
            ExternKind::Table => module.tables.size(),
            ExternKind::Memory => module.memories.size(),
            ExternKind::Global => module.globals.size(),
            ExternKind::Exception => module.exception_types.size(),
        };
        if (export.index as usize) >= space_size {
            invalid!(
                "export {:?} references index {} which is out of range",
                export.name,
                export.index
            );
        }
    }
    Ok(())
}

/// Validates that the start function, if declared, exists and is nullary.
pub fn validate_start_function(module: &Module) -> Result<(), ValidationError> {
    if let Some(start_function_index) = module.start_function_index {
        let ty = match module.function_type(start_function_index) {
            Some(ty) => ty,
            None => invalid!("start function index {} is out of range", start_function_index),
        };
        if !ty.params().is_empty() || !ty.results().is_empty() {
            invalid!("start function must have no parameters and no results");
        }
    }
    Ok(())
}

/// Validates element segments. Function references inside element segments
/// are checked here, before code validation: the function index space is
/// fully declared by this point.
pub fn validate_elem_segments(module: &Module) -> Result<(), ValidationError> {
    for (index, segment) in module.elem_segments.iter().enumerate() {
        if segment.is_active {
            if (segment.table_index as usize) >= module.tables.size() {
                invalid!(
                    "elem segment {} references table {} which is out of range",
                    index,
                    segment.table_index
                );
            }
            validate_initializer(
                module,
                &segment.base_offset,
                Type::I32,
                module.globals.size(),
            )?;
        }
        for &function_index in &segment.indices {
            if (function_index as usize) >= module.functions.size() {
                invalid!(
                    "elem segment {} references function {} which is out of range",
                    index,
                    function_index
                );
            }
        }
    }
    Ok(())
}

/// Validates data segments against the deferred state accumulated during
/// code validation.
pub fn validate_data_segments(
    module: &Module,
    deferred: &DeferredCodeValidationState,
) -> Result<(), ValidationError> {
    for (index, segment) in module.data_segments.iter().enumerate() {
        if segment.is_active {
            if (segment.memory_index as usize) >= module.memories.size() {
                invalid!(
                    "data segment {} references memory {} which is out of range",
                    index,
                    segment.memory_index
                );
            }
            validate_initializer(
                module,
                &segment.base_offset,
                Type::I32,
                module.globals.size(),
            )?;
        }
    }
    if deferred.required_num_data_segments > module.data_segments.len() {
        invalid!(
            "code references data segment {} but the module declares only {}",
            deferred.required_num_data_segments - 1,
            module.data_segments.len()
        );
    }
    Ok(())
}

/// Runs every pass over the sections that precede code.
pub fn validate_pre_code_sections(module: &Module) -> Result<(), ValidationError> {
    validate_types(module)?;
    validate_imports(module)?;
    validate_function_declarations(module)?;
    validate_table_defs(module)?;
    validate_memory_defs(module)?;
    validate_global_defs(module)?;
    validate_exception_type_defs(module)?;
    validate_exports(module)?;
    validate_start_function(module)?;
    validate_elem_segments(module)?;
    Ok(())
}

/// Runs the passes that must wait until the sections after code are loaded.
pub fn validate_post_code_sections(
    module: &Module,
    deferred: &DeferredCodeValidationState,
) -> Result<(), ValidationError> {
    validate_data_segments(module, deferred)
}

/// Validates the whole module: pre-code sections, every function body, then
/// the deferred post-code checks. Validation never mutates the module, so
/// repeating it yields the same outcome.
pub fn validate_module(module: &Module) -> Result<(), ValidationError> {
    validate_pre_code_sections(module)?;

    let mut deferred = DeferredCodeValidationState::default();
    for (def_index, def) in module.functions.defs.iter().enumerate() {
        let in_function = |error: ValidationError| ValidationError {
            message: format!(
                "in function {}: {}",
                module.functions.imports.len() + def_index,
                error.message
            ),
        };
        let mut validator = CodeValidator::new(module, def, &mut deferred).map_err(in_function)?;
        for op in &def.code {
            validator.operator(op).map_err(|error| ValidationError {
                message: format!(
                    "in function {}, at {}: {}",
                    module.functions.imports.len() + def_index,
                    op,
                    error.message
                ),
            })?;
        }
        validator.finish().map_err(in_function)?;
    }
    trace!(
        num_function_defs = module.functions.defs.len(),
        required_num_data_segments = deferred.required_num_data_segments,
        "validated module code"
    );

    validate_post_code_sections(module, &deferred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::FunctionDef;
    use wavelet_types::FunctionType;

    fn module_with_body(results: Vec<Type>, code: Vec<Operator>) -> Module {
        let mut module = Module::default();
        module.types.push(FunctionType::new(vec![], results));
        module.functions.defs.push(FunctionDef {
            type_index: 0,
            non_parameter_locals: vec![],
            code,
        });
        module
    }

    #[test]
    fn const_function_validates() {
        let module = module_with_body(
            vec![Type::I32],
            vec![Operator::I32Const { value: 42 }, Operator::End {}],
        );
        assert!(validate_module(&module).is_ok());
    }

    #[test]
    fn dropped_result_fails() {
        // (func (result i32) i32.const 1 drop) leaves nothing for the
        // declared result.
        let module = module_with_body(
            vec![Type::I32],
            vec![
                Operator::I32Const { value: 1 },
                Operator::Drop {},
                Operator::End {},
            ],
        );
        let error = validate_module(&module).unwrap_err();
        assert!(error.message.contains("underflow"), "{}", error.message);
    }

    #[test]
    fn type_mismatch_reports_both_types() {
        let module = module_with_body(
            vec![Type::I32],
            vec![Operator::I64Const { value: 1 }, Operator::End {}],
        );
        let error = validate_module(&module).unwrap_err();
        assert!(error.message.contains("expected i32"), "{}", error.message);
    }

    #[test]
    fn unreachable_makes_stack_polymorphic() {
        // Anything can be popped after unreachable; the function still ends
        // with a well-typed result.
        let module = module_with_body(
            vec![Type::I32],
            vec![
                Operator::Unreachable {},
                Operator::I64Add {},
                Operator::Drop {},
                Operator::I32Const { value: 3 },
                Operator::End {},
            ],
        );
        assert!(validate_module(&module).is_ok());
    }

    #[test]
    fn branch_checks_label_types() {
        // br 0 inside an i32 block without an i32 on the stack.
        let module = module_with_body(
            vec![],
            vec![
                Operator::Block {
                    block_type: BlockType::Value(Type::I32),
                },
                Operator::Br { depth: 0 },
                Operator::End {},
                Operator::Drop {},
                Operator::End {},
            ],
        );
        let error = validate_module(&module).unwrap_err();
        assert!(error.message.contains("underflow"), "{}", error.message);
    }

    #[test]
    fn loop_branches_target_parameters() {
        // A backward branch to a parameterless loop needs no operands even
        // though the loop produces an i32.
        let module = module_with_body(
            vec![Type::I32],
            vec![
                Operator::Loop {
                    block_type: BlockType::Value(Type::I32),
                },
                Operator::Br { depth: 0 },
                Operator::End {},
                Operator::End {},
            ],
        );
        assert!(validate_module(&module).is_ok());
    }

    #[test]
    fn if_without_else_requires_balanced_types() {
        let module = module_with_body(
            vec![Type::I32],
            vec![
                Operator::I32Const { value: 1 },
                Operator::If {
                    block_type: BlockType::Value(Type::I32),
                },
                Operator::I32Const { value: 2 },
                Operator::End {},
                Operator::End {},
            ],
        );
        let error = validate_module(&module).unwrap_err();
        assert!(error.message.contains("without else"), "{}", error.message);
    }

    #[test]
    fn memory_init_defers_data_segment_check() {
        let mut module = module_with_body(
            vec![],
            vec![
                Operator::I32Const { value: 0 },
                Operator::I32Const { value: 0 },
                Operator::I32Const { value: 0 },
                Operator::MemoryInit {
                    data_index: 3,
                    memory_index: 0,
                },
                Operator::End {},
            ],
        );
        module.memories.defs.push(crate::module::MemoryDef {
            ty: wavelet_types::MemoryType::new(1u32, None, false),
        });
        let error = validate_module(&module).unwrap_err();
        assert!(
            error.message.contains("data segment 3"),
            "{}",
            error.message
        );
    }

    #[test]
    fn validation_is_idempotent() {
        let module = module_with_body(
            vec![Type::I32],
            vec![Operator::I32Const { value: 42 }, Operator::End {}],
        );
        assert_eq!(validate_module(&module).is_ok(), validate_module(&module).is_ok());
        let module = module_with_body(vec![Type::I32], vec![Operator::End {}]);
        assert_eq!(
            validate_module(&module).unwrap_err(),
            validate_module(&module).unwrap_err()
        );
    }

    #[test]
    fn export_names_must_be_unique() {
        let mut module = module_with_body(vec![], vec![Operator::End {}]);
        module.exports.push(crate::module::Export {
            name: "f".to_string(),
            kind: ExternKind::Function,
            index: 0,
        });
        module.exports.push(crate::module::Export {
            name: "f".to_string(),
            kind: ExternKind::Function,
            index: 0,
        });
        let error = validate_module(&module).unwrap_err();
        assert!(error.message.contains("duplicate"), "{}", error.message);
    }
}
