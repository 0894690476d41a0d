//! House arrest
//!
//! Exposes an application's sandbox to the host. After a successful vend
//! request the same socket speaks AFC, rooted at the requested directory.

use plist_macro::plist;
use tracing::debug;

use crate::{DeviceError, ServiceClient, ServiceConnection, services};

use super::afc::{AfcClient, AfcScope};

/// Client for the house arrest service
#[derive(Debug)]
pub struct HouseArrestClient {
    connection: ServiceConnection,
}

impl ServiceClient for HouseArrestClient {
    fn service_name() -> &'static str {
        services::HOUSE_ARREST
    }

    async fn from_connection(connection: ServiceConnection) -> Result<Self, DeviceError> {
        Ok(Self::new(connection))
    }
}

impl HouseArrestClient {
    pub fn new(connection: ServiceConnection) -> Self {
        Self { connection }
    }

    /// Turns the connection into an AFC client rooted at the app's full container
    ///
    /// # Arguments
    /// * `bundle_id` - The bundle identifier of the target app (e.g., "com.example.MyApp")
    ///
    /// # Errors
    /// `InvalidArgument` if no such application is installed
    pub async fn vend_container(self, bundle_id: &str) -> Result<AfcClient, DeviceError> {
        self.vend(bundle_id, "VendContainer").await
    }

    /// Same as [`HouseArrestClient::vend_container`] but rooted at `Documents`
    pub async fn vend_documents(self, bundle_id: &str) -> Result<AfcClient, DeviceError> {
        self.vend(bundle_id, "VendDocuments").await
    }

    async fn vend(mut self, bundle_id: &str, cmd: &str) -> Result<AfcClient, DeviceError> {
        self.connection
            .send_plist(plist!({
                "Command": cmd,
                "Identifier": bundle_id,
            }))
            .await?;
        match self.connection.read_plist().await {
            Ok(_) => {}
            Err(DeviceError::DeviceReported(e)) | Err(DeviceError::OperationFailed(e))
                if e.starts_with("ApplicationLookupFailed") =>
            {
                return Err(DeviceError::InvalidArgument(format!(
                    "no application {bundle_id}"
                )));
            }
            Err(e) => return Err(e),
        }
        debug!("Vended {cmd} for {bundle_id}");

        Ok(AfcClient::new(
            self.connection,
            AfcScope::Application(bundle_id.to_string()),
        ))
    }
}
