//! Wire types of the request correlator.

use {
    crate::{
        address::Address,
        error::{ClusterNetError, Result},
    },
    serde::{Deserialize, Serialize},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderType {
    Req,
    Rsp,
    GetReqStatus,
    GetReqStatusRsp,
    NHopReq,
    NHopRsp,
}

impl HeaderType {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Req => 0,
            Self::Rsp => 1,
            Self::GetReqStatus => 3,
            Self::GetReqStatusRsp => 4,
            Self::NHopReq => 5,
            Self::NHopRsp => 6,
        }
    }
}

/// Correlation header attached to every request and reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelatorHeader {
    pub header_type: HeaderType,
    pub id: i64,
    pub rsp_expected: bool,
    /// When set, only these members process the message.
    pub dest_members: Option<Vec<Address>>,
    /// Receivers drop the message when this is false.
    pub do_process: bool,
    /// Reply here instead of to the sender (n-hop forwarding).
    pub whom_to_reply: Option<Address>,
    /// An additional reply will arrive from this node (n-hop reply).
    pub expect_response_from: Option<Address>,
    /// Request whose state a [`HeaderType::GetReqStatus`] query asks about.
    pub status_req_id: i64,
}

impl CorrelatorHeader {
    pub fn new(header_type: HeaderType, id: i64, rsp_expected: bool) -> Self {
        Self {
            header_type,
            id,
            rsp_expected,
            dest_members: None,
            do_process: true,
            whom_to_reply: None,
            expect_response_from: None,
            status_req_id: -1,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(
            self.header_type,
            HeaderType::Rsp | HeaderType::GetReqStatusRsp | HeaderType::NHopRsp
        )
    }

    pub fn kind(&self) -> &'static str {
        match self.header_type {
            HeaderType::Req => "req",
            HeaderType::Rsp => "rsp",
            HeaderType::GetReqStatus => "get_req_status",
            HeaderType::GetReqStatusRsp => "get_req_status_rsp",
            HeaderType::NHopReq => "nhop_req",
            HeaderType::NHopRsp => "nhop_rsp",
        }
    }
}

/// Processing state of a request as recorded by the node that received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    NotReceived,
    ReceivedNotProcessed,
    Processed,
}

/// Body of every reply the correlator sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePayload {
    /// Bytes returned by the request handler.
    Value(Vec<u8>),
    /// The handler failed; carries its error text.
    Failure(String),
    /// Answer to a status query.
    Status(RequestState),
}

impl ResponsePayload {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(ClusterNetError::Serialization)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(ClusterNetError::Serialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_defaults() {
        let hdr = CorrelatorHeader::new(HeaderType::NHopReq, 4, true);
        assert!(hdr.do_process);
        assert!(hdr.dest_members.is_none());
        assert_eq!(hdr.status_req_id, -1);
        assert!(!hdr.is_reply());
        assert_eq!(hdr.kind(), "nhop_req");
        assert_eq!(hdr.header_type.type_tag(), 5);
        assert!(CorrelatorHeader::new(HeaderType::GetReqStatusRsp, 0, false).is_reply());
    }

    #[test]
    fn test_failure_payload_decodes() {
        let bytes = ResponsePayload::Failure("key locked".to_string())
            .encode()
            .unwrap();
        assert_eq!(
            ResponsePayload::decode(&bytes).unwrap(),
            ResponsePayload::Failure("key locked".to_string())
        );
        assert!(ResponsePayload::decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
