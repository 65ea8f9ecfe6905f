pub mod devcontainer;
pub mod mount;
pub mod parser;
pub mod ports;
pub mod settings;
pub mod substitution;
pub mod validation;

pub use devcontainer::{DevContainerConfig, ImageSource, LifecycleCommand};
pub use mount::{MountKind, MountSpec};
pub use parser::{ConfigFormat, ConfigParser, ConfigParserOptions};
pub use ports::{ForwardPort, OnAutoForward, PortAttributes, PortKey};
pub use settings::Settings;
pub use substitution::{substitute_config, SubstitutionContext};
pub use validation::{validate_devcontainer_config, ValidationReport};
