pub mod bitmap;
pub mod lookahead;
