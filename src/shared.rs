use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Name of the local docker daemon entry in the host pool.
pub const LOCAL_HOST: &str = "local";

macro_rules! name_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Deserialize, Serialize, Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

name_type!(
    /// Name of an entry in the host pool, also the name of its git branch.
    HostName
);
name_type!(ProjectName);
name_type!(ServiceName);
name_type!(ContainerId);
name_type!(ImageDigest);
name_type!(
    /// The name of an image as used in docker in the form `repo:tag`. E.g. "nginx:1.25"
    ImageName
);

impl HostName {
    pub fn local() -> Self {
        Self(LOCAL_HOST.to_string())
    }

    pub fn is_local(&self) -> bool {
        self.0 == LOCAL_HOST
    }
}

impl ImageName {
    /// Splits into repository and tag. The tag defaults to `latest`; a registry
    /// port (`host:5000/repo`) is not mistaken for a tag and digests are kept whole.
    pub fn split(&self) -> (&str, &str) {
        if let Some((repo, digest)) = self.0.split_once('@') {
            return (repo, digest);
        }
        match self.0.rsplit_once(':') {
            Some((repo, tag)) if !tag.contains('/') => (repo, tag),
            _ => (self.0.as_str(), "latest"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name_split_with_tag() {
        let image = ImageName::new("nginx:1.25");
        assert_eq!(image.split(), ("nginx", "1.25"));
    }

    #[test]
    // Ensure that the default tag is "latest" if no tag is specified
    fn test_image_name_split_no_tag() {
        let image = ImageName::new("ghcr.io/org/app");
        assert_eq!(image.split(), ("ghcr.io/org/app", "latest"));
    }

    #[test]
    fn test_image_name_split_registry_port() {
        let image = ImageName::new("registry:5000/app");
        assert_eq!(image.split(), ("registry:5000/app", "latest"));
        let image = ImageName::new("registry:5000/app:2");
        assert_eq!(image.split(), ("registry:5000/app", "2"));
    }

    #[test]
    fn local_host_name() {
        assert!(HostName::local().is_local());
        assert!(!HostName::new("remote").is_local());
    }
}
