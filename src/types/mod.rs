pub mod price;
pub mod symbol;

pub use price::{Price, PRICE_SCALE};
pub use symbol::{InvalidSymbol, Symbol};
