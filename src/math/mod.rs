mod quadrature;
mod special;

pub use quadrature::GaussLegendre;
pub use special::factorial_ratio;
pub use special::legendre;
pub use special::legendre_with_derivative;
pub use special::sine_cosine;
pub use special::AngularTables;
