pub mod emit;
pub mod forward;
pub mod io;
pub mod matrices;
pub mod model;
pub mod progress;
pub mod sequences;
pub mod states;
pub mod thread;
pub mod traceback;
pub mod trans;
pub mod tree;
pub mod utils;

pub use model::ArgModel;
pub use sequences::Sequences;
pub use states::State;
pub use tree::{LocalTree, LocalTrees, Spr};
