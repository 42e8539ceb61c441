pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use approx::abs_diff_eq;
pub use getset::{CopyGetters, Getters};
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools as _};
pub use log::{info, warn};
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::borrow::Borrow;
pub use tch::{Device, IndexOp, Kind, Reduction, Tensor};
pub use tch_tensor_like::TensorLike;

unzip_n::unzip_n!(pub 2);
unzip_n::unzip_n!(pub 4);
unzip_n::unzip_n!(pub 6);
