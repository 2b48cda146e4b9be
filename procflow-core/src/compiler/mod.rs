//! Procedure compiler: declarative JSON → verified, bound IR.

pub mod binder;
pub mod ir;
pub mod parser;
pub mod verifier;

use std::collections::HashSet;

use serde_json::Value;

use crate::error::{OrchError, OrchResult};
use ir::IrProcedure;

/// Parse, bind, and verify a procedure definition in one pass.
///
/// `known_procedures` is the set of procedure ids that subflow nodes may
/// reference (usually everything currently published in the store).
pub fn compile(definition: &Value, known_procedures: &HashSet<String>) -> OrchResult<IrProcedure> {
    let mut ir = parser::parse_procedure(definition)?;
    binder::bind_executors(&mut ir);

    let errors = verifier::verify(&ir, known_procedures);
    if !errors.is_empty() {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(OrchError::validation(format!(
            "procedure verification failed: {}",
            messages.join("; ")
        )));
    }

    Ok(ir)
}
