//! Built-in post-stages.

mod majority_vote;
mod only_diff;

pub use majority_vote::MajorityVote;
pub use only_diff::OnlyDiff;
