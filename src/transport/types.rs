use std::fmt;
use std::str::FromStr;

use libgit2_sys as raw;

use crate::errors::GitError;

/// Git service types for smart protocol
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ServiceType {
    UploadPack,
    ReceivePack,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceType::UploadPack => write!(f, "git-upload-pack"),
            ServiceType::ReceivePack => write!(f, "git-receive-pack"),
        }
    }
}

impl FromStr for ServiceType {
    type Err = GitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git-upload-pack" => Ok(ServiceType::UploadPack),
            "git-receive-pack" => Ok(ServiceType::ReceivePack),
            _ => Err(GitError::UnsupportedAction(s.to_string())),
        }
    }
}

impl ServiceType {
    /// `Content-Type` of a transfer request body.
    pub fn request_content_type(&self) -> String {
        format!("application/x-{self}-request")
    }

    /// `Content-Type` of a transfer response body.
    pub fn result_content_type(&self) -> String {
        format!("application/x-{self}-result")
    }

    /// `Content-Type` of a smart ref advertisement.
    pub fn advertisement_content_type(&self) -> String {
        format!("application/x-{self}-advertisement")
    }
}

/// The four actions of the smart protocol negotiation.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum SmartServiceAction {
    /// Ref advertisement before a fetch.
    UploadPackLs,
    /// Pack negotiation and transfer for a fetch.
    UploadPack,
    /// Ref advertisement before a push.
    ReceivePackLs,
    /// Pack transfer for a push.
    ReceivePack,
}

impl SmartServiceAction {
    pub fn service(&self) -> ServiceType {
        match self {
            SmartServiceAction::UploadPackLs | SmartServiceAction::UploadPack => {
                ServiceType::UploadPack
            }
            SmartServiceAction::ReceivePackLs | SmartServiceAction::ReceivePack => {
                ServiceType::ReceivePack
            }
        }
    }

    pub fn is_advertisement(&self) -> bool {
        matches!(
            self,
            SmartServiceAction::UploadPackLs | SmartServiceAction::ReceivePackLs
        )
    }

    /// Whether `next` is the transfer that pairs with this advertisement.
    pub fn continues_with(&self, next: SmartServiceAction) -> bool {
        matches!(
            (self, next),
            (SmartServiceAction::UploadPackLs, SmartServiceAction::UploadPack)
                | (SmartServiceAction::ReceivePackLs, SmartServiceAction::ReceivePack)
        )
    }

    pub(crate) fn from_raw(action: raw::git_smart_service_t) -> Result<Self, GitError> {
        match action {
            raw::GIT_SERVICE_UPLOADPACK_LS => Ok(SmartServiceAction::UploadPackLs),
            raw::GIT_SERVICE_UPLOADPACK => Ok(SmartServiceAction::UploadPack),
            raw::GIT_SERVICE_RECEIVEPACK_LS => Ok(SmartServiceAction::ReceivePackLs),
            raw::GIT_SERVICE_RECEIVEPACK => Ok(SmartServiceAction::ReceivePack),
            other => Err(GitError::UnsupportedAction(format!("{other}"))),
        }
    }
}

impl fmt::Display for SmartServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_advertisement() {
            write!(f, "{}-ls", self.service())
        } else {
            write!(f, "{}", self.service())
        }
    }
}

/// Direction of a remote connection.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Direction {
    Fetch,
    Push,
}

impl Direction {
    pub(crate) fn raw(self) -> raw::git_direction {
        match self {
            Direction::Fetch => raw::GIT_DIRECTION_FETCH,
            Direction::Push => raw::GIT_DIRECTION_PUSH,
        }
    }
}
