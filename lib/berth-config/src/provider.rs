use std::path::Path;

use figment::{
    providers::{Data, Serialized, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};

/// A provider whose data was fully read up front, so it can be held across threads.
pub struct ResolvedProvider {
    data: Map<Profile, Dict>,
    metadata: Metadata,
}

impl ResolvedProvider {
    pub fn from_yaml<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let file_data = std::fs::read_to_string(path.as_ref()).map_err(|e| e.to_string())?;
        let data = Data::<Yaml>::string(&file_data).data()?;

        Ok(Self {
            data,
            metadata: Metadata::from("YAML file", path.as_ref()),
        })
    }
}

impl Provider for ResolvedProvider {
    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}

pub struct BoxedProvider(Box<dyn Provider + Send + Sync>);

impl BoxedProvider {
    pub fn new<P>(provider: P) -> Self
    where
        P: Provider + Send + Sync + 'static,
    {
        Self(Box::new(provider))
    }

    pub fn serialized(values: Dict) -> Self {
        Self(Box::new(Serialized::defaults(values)))
    }
}

impl Provider for BoxedProvider {
    fn metadata(&self) -> Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        self.0.data()
    }
}
