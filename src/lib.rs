//! Michael and Scott. Simple, Fast, and Practical Non-Blocking and Blocking
//! Concurrent Queue Algorithms. PODC 1996.
//! http://dl.acm.org/citation.cfm?id=248052.248106

pub mod queue;

pub use crate::queue::Queue;
