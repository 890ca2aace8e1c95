// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What a successful build leaves behind.

use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;
use serde_derive::Serialize;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// Which builder produced this artifact.
    pub builder_id: &'static str,

    /// Inventory id of the VM, or the published image name.
    pub id: String,
    pub name: String,
    pub datacenter: Option<String>,

    /// Folder or namespace the result lives in.
    pub location: Option<String>,

    pub files: Vec<Utf8PathBuf>,
    pub content_library: Option<String>,
    pub image_name: Option<String>,

    /// Free-form details, such as whether the VM was turned into a template.
    pub state: BTreeMap<String, String>,
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.builder_id, self.name, self.id)?;
        if let Some(dc) = &self.datacenter {
            write!(f, "\n  datacenter: {dc}")?;
        }
        if let Some(loc) = &self.location {
            write!(f, "\n  location: {loc}")?;
        }
        if let Some(item) = &self.content_library {
            write!(f, "\n  content library item: {item}")?;
        }
        if let Some(image) = &self.image_name {
            write!(f, "\n  image: {image}")?;
        }
        for file in &self.files {
            write!(f, "\n  file: {file}")?;
        }
        for (k, v) in &self.state {
            write!(f, "\n  {k}: {v}")?;
        }
        Ok(())
    }
}
