pub mod attention;
pub mod chat;
pub mod checkpoint;
pub mod data;
pub mod decoding;
pub mod metrics;
pub mod model;
pub mod optim;
pub mod training;
pub mod vocab;
