pub mod charset;
pub mod collation;
pub mod function;

pub use charset::CollationContext;
pub use collation::{infer_collation, CollationArg, Coercibility, EvalType, ExprCollation, Repertoire};
pub use function::{derive_collation, resolve, ScalarFunc};
