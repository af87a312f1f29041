//! Rewriting the identity and visibility of ECMA-335 managed assemblies.
//!
//! This library parses a managed PE image, exposes its metadata tables and
//! heaps, and applies a small set of high-level mutations: renaming the
//! assembly, rewriting its public key, redirecting external assembly
//! references, internalizing types and granting friend access. The result
//! is emitted as a new, valid PE image, optionally re-signed with a
//! strong-name signature. It exists so that multiple copies of a library
//! can coexist in one process under distinct names.
//!
//! The editor never rewrites method bodies, the instruction stream or the
//! `#US` heap; it does not resolve types or load referenced assemblies.
//!
//! # Example
//! ```no_run
//! use shade_image::{Editor, RefIdentity};
//!
//! let mut editor = Editor::open("Widgets.dll")?;
//! editor.rename("Widgets_Shaded")?;
//! editor.internalize_types()?;
//! editor.add_friend("Widgets.Host", None)?;
//! editor.save("Widgets_Shaded.dll", None)?;
//! # Ok::<(), shade_image::Error>(())
//! ```
//!
//! # Structure of an image
//! The metadata sits behind the PE container's CLI header: a root with a
//! directory of *streams* — `#Strings`, `#Blob`, `#GUID`, `#US` and the
//! `#~` table stream, whose packed row layout depends on the sizes of the
//! heaps and tables around it. Editing therefore splits into a read-only
//! source view, a plan of staged row overrides and appends, and writers
//! that re-emit the metadata blob and patch the surrounding container.

#![warn(missing_docs)]

mod editor;
mod error;
mod plan;

pub mod format;
pub mod pe;
pub mod strongname;

pub use editor::{Editor, RefIdentity};
pub use error::{Error, ErrorKind, Result};
pub use strongname::{public_key_token, verify_image, StrongNameKey};
