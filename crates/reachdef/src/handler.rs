//! User-supplied treatment of call targets.

use crate::{code_location::CodeLocation, state::ReachingDefinitions};

/// Hooks invoked when the analysis reaches a function call.
///
/// The default implementations decline everything, which leaves the state
/// unchanged and logs a warning at the call site.
pub trait FunctionHandler {
    /// Handles a call to the named external function. Returning `false`
    /// means the call was not handled.
    fn handle_external(
        &mut self,
        _state: &mut ReachingDefinitions,
        _name: &str,
        _codeloc: CodeLocation,
    ) -> bool {
        false
    }

    /// Handles a call to a function inside the main object. Returning a
    /// state replaces the caller's state with it.
    fn handle_local_function(
        &mut self,
        _state: &ReachingDefinitions,
        _func_addr: u64,
        _current_depth: u32,
        _maximum_depth: u32,
    ) -> Option<ReachingDefinitions> {
        None
    }
}
