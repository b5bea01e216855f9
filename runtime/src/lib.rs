//! Runtime support for the typestate APIs generated by `scrivener-compiler`.
//!
//! Generated state types wrap a [`Session`], which talks to the other roles
//! through an in-process [`Mesh`]. Parallel blocks fork a session into branch
//! sessions and join them again through a [`JoinBarrier`].
//!
//! ```
//! use scrivener_runtime::{Mesh, Session};
//!
//! let mesh: Mesh<String> = Mesh::new(["Buyer", "Seller"]);
//! let buyer = Session::new(mesh.endpoint("Buyer").unwrap());
//! let seller = Session::new(mesh.endpoint("Seller").unwrap());
//!
//! seller.send("Buyer", "price", "42".to_string()).unwrap();
//! assert_eq!(buyer.recv("Seller", "price").unwrap(), "42");
//! ```

pub mod error;
pub mod join;
pub mod mesh;
pub mod session;

pub use error::SessionError;
pub use join::JoinBarrier;
pub use mesh::{Endpoint, Mesh};
pub use session::{BranchDone, Finished, Joiner, Session};
