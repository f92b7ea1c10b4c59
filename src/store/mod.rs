//! Signal cache.
//!
//! [`CanbusData`] keeps the latest frame per bus address and answers
//! bit-field queries against it. One cache exists per connection and is
//! shared with readers through an `Arc`.
//!
//! # Example
//!
//! ```rust,ignore
//! use cangw::store::CanbusData;
//!
//! let data = connection.data();
//! if let Some(value) = data.get_number(&signal) {
//!     println!("{} = {}", signal, value);
//! }
//! ```

mod canbus_data;

pub use canbus_data::{CanbusData, MutableCanbusData};
