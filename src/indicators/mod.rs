// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators the risk manager
// and regime detector need (§4.4). Every public function returns `Option<T>`
// so callers are forced to handle insufficient-data and numerical-edge-case
// scenarios.

pub mod adx;
pub mod atr;
