pub mod banded_sw;
pub mod cigar;
pub mod fragment;
pub mod match_finder;
pub mod quality;
pub mod shadow;
pub mod template;
pub mod template_builder;
pub mod tls;
pub mod ungapped;

pub use cigar::{Cigar, CigarOp};
pub use fragment::FragmentMetadata;
pub use template::{Template, TemplateClass};
