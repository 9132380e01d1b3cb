//! Models module.
//!
//! Both model families implement [`RatingPredictor`](crate::RatingPredictor).
pub mod factorization;
pub mod neighborhood;

pub use self::factorization::LatentFactorModel;
pub use self::neighborhood::NeighborhoodModel;
