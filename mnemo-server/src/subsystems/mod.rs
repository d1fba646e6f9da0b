pub mod distill;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod worker;
