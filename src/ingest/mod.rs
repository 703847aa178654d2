mod blocks;
pub(crate) mod normalize;
mod orchestrator;
mod searx;

pub use orchestrator::Ingester;
