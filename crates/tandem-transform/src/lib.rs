//! # tandem-transform
//!
//! The document model shared by the Tandem server and clients.
//!
//! This crate provides:
//! - [`Doc`] - an immutable plain-text document addressed by character offsets
//! - [`Step`] - an invertible replace operation on a document
//! - [`StepMap`] / [`Mapping`] - position mapping through applied steps,
//!   with slicing and mirror recovery for rebasing
//! - [`Transform`] - a document plus the steps applied to it so far
//!
//! ## Example
//!
//! ```rust
//! use tandem_transform::{Assoc, Doc, Step, Transform};
//!
//! let mut tr = Transform::new(Doc::new("hello world"));
//! tr.step(Step::insert(5, ",")).unwrap();
//! tr.step(Step::delete(7, 12)).unwrap();
//!
//! assert_eq!(tr.doc().text(), "hello, ");
//! assert_eq!(tr.mapping().map(11, Assoc::After), 7);
//! ```

pub mod doc;
pub mod error;
pub mod mapping;
pub mod step;
pub mod transform;

pub use doc::Doc;
pub use error::{Result, StepError};
pub use mapping::{Assoc, MapRange, MapResult, Mapping, Recover, StepMap};
pub use step::Step;
pub use transform::Transform;
