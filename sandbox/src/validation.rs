//! Guest module validation: ABI compatibility checks.
//!
//! Run before instantiation so a wrong binary fails with a precise message
//! instead of a trap on first use. Checks:
//!
//! 1. `memory` export present
//! 2. Mode-specific function exports present with the expected signatures
//! 3. Every import is a known `env` callback or a WASI preview1 function

use wasmtime::{ExternType, Module, ValType};

use crate::abi::{self, ENV_MODULE, WASI_MODULE};
use crate::error::{BridgeError, Result};
use crate::runtime::InstanceMode;

/// Expected export: (name, param count, result count). All values are i32.
const LIBRARY_EXPORTS: &[(&str, usize, usize)] = &[(abi::MALLOC, 1, 1), (abi::FREE, 1, 0)];

const PROGRAM_EXPORTS: &[(&str, usize, usize)] = &[(abi::START, 0, 0)];

fn is_i32(vt: &ValType) -> bool {
    matches!(vt, ValType::I32)
}

/// Validate exports for `mode`, then imports.
pub fn validate_module(module: &Module, mode: InstanceMode) -> Result<()> {
    let required = match mode {
        InstanceMode::Library => LIBRARY_EXPORTS,
        InstanceMode::Program => PROGRAM_EXPORTS,
    };
    validate_exports(module, required)?;
    validate_imports(module)?;
    Ok(())
}

fn validate_exports(module: &Module, required: &[(&str, usize, usize)]) -> Result<()> {
    let has_memory = module
        .exports()
        .any(|e| e.name() == abi::MEMORY && matches!(e.ty(), ExternType::Memory(_)));
    if !has_memory {
        return Err(BridgeError::Validation("module must export 'memory'".into()));
    }

    for &(name, param_count, result_count) in required {
        let export = module
            .exports()
            .find(|e| e.name() == name)
            .ok_or_else(|| BridgeError::MissingExport(name.to_string()))?;

        let func_ty = match export.ty() {
            ExternType::Func(ft) => ft,
            _ => {
                return Err(BridgeError::Validation(format!(
                    "export '{}' must be a function",
                    name
                )));
            }
        };

        let params: Vec<ValType> = func_ty.params().collect();
        let results: Vec<ValType> = func_ty.results().collect();
        if params.len() != param_count
            || !params.iter().all(is_i32)
            || results.len() != result_count
            || !results.iter().all(is_i32)
        {
            return Err(BridgeError::Validation(format!(
                "export '{}' has wrong signature: expected {} i32 params and {} i32 results, got {} params and {} results",
                name,
                param_count,
                result_count,
                params.len(),
                results.len()
            )));
        }
    }

    Ok(())
}

/// Every import must be something the linker will provide.
fn validate_imports(module: &Module) -> Result<()> {
    for import in module.imports() {
        let provided = match import.module() {
            ENV_MODULE => {
                abi::HOST_CALLBACKS.contains(&import.name())
                    && matches!(import.ty(), ExternType::Func(_))
            }
            WASI_MODULE => matches!(import.ty(), ExternType::Func(_)),
            _ => false,
        };
        if !provided {
            return Err(BridgeError::Instantiation(format!(
                "unresolved import '{}::{}'",
                import.module(),
                import.name()
            )));
        }
    }
    Ok(())
}
