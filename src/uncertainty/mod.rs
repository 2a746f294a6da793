// =============================================================================
// Uncertainty Control Loop
// =============================================================================
//
// Every cycle the uncertainty council asks the configured LLM providers to
// rate system-wide uncertainty, aggregates their votes into a score/label,
// and derives the two scalar multipliers (cadence, decay) that soft-govern
// the scheduler and allocator. The deterministic risk layer (drawdown
// governor, hard halts) never depends on this loop.

pub mod council;
pub mod transition;

pub use council::{
    aggregate, compute_controls, run_uncertainty_council, UncertaintyAssessment,
    UncertaintyControls, UncertaintyVote,
};
pub use transition::{detect_transition, TransitionWarning};
