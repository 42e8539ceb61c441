pub use anyhow::{ensure, Result};
pub use num_traits::{Float, NumCast, ToPrimitive};
pub use std::mem;
