pub mod bitmap;
pub mod state;

pub use bitmap::ValidityBitmap;
pub use state::State;
