pub mod nn;
pub mod reference;
pub mod tensor;
pub mod util;
