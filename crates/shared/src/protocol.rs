use serde::{Deserialize, Serialize};

use crate::{
    domain::{Contact, ContactKind, Gender},
    error::ApiError,
};

/// Session credentials attached to every authenticated call. The remote
/// service expects its own PascalCase field names; the pass ticket travels
/// in the query string, never in the JSON body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseRequest {
    #[serde(rename = "Sid")]
    pub sid: String,
    #[serde(rename = "Skey")]
    pub skey: String,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "Uin")]
    pub uin: i64,
    #[serde(skip)]
    pub pass_ticket: String,
}

/// Uniform result envelope every authenticated response reports.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BaseResponse {
    pub ret: i64,
    pub err_msg: String,
}

impl BaseResponse {
    pub fn is_success(&self) -> bool {
        self.ret == 0
    }

    pub fn to_error(&self) -> ApiError {
        ApiError {
            ret: self.ret,
            message: self.err_msg.clone(),
        }
    }
}

/// Decoded response shapes implement this so the transport can enforce the
/// result envelope uniformly and pick up server-side credential rotation.
pub trait ApiCall {
    fn base_response(&self) -> &BaseResponse;

    /// A rotated security key, when the response carries one.
    fn rotated_skey(&self) -> Option<&str> {
        None
    }
}

/// Loosely-typed contact record as delivered on the wire, validated once at
/// the boundary. Every field is defaulted: the service omits whatever it
/// feels like per endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawContact {
    pub user_name: String,
    pub nick_name: String,
    #[serde(rename = "HeadImgUrl")]
    pub head_img_url: String,
    pub remark_name: String,
    pub display_name: String,
    pub sex: i64,
    pub signature: String,
    pub verify_flag: i64,
    pub contact_flag: i64,
    pub province: String,
    pub city: String,
    pub alias: String,
    #[serde(rename = "EncryChatRoomId")]
    pub encry_chat_room_id: String,
    pub member_list: Vec<RawContact>,
}

impl Contact {
    pub fn from_raw(raw: &RawContact, kind: ContactKind) -> Contact {
        Contact {
            user_name: raw.user_name.clone(),
            nick_name: raw.nick_name.clone(),
            remark_name: raw.remark_name.clone(),
            display_name: raw.display_name.clone(),
            alias: raw.alias.clone(),
            avatar_url: raw.head_img_url.clone(),
            gender: Gender::from_wire(raw.sex),
            signature: raw.signature.clone(),
            province: raw.province.clone(),
            city: raw.city.clone(),
            verify_flag: raw.verify_flag,
            contact_flag: raw.contact_flag,
            kind,
            members: Vec::new(),
        }
    }
}

/// One page of the paginated full contact sync. `seq == 0` is the
/// completion sentinel.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContactPageResponse {
    pub base_response: BaseResponse,
    pub member_count: i64,
    pub member_list: Vec<RawContact>,
    pub seq: i64,
}

impl ApiCall for ContactPageResponse {
    fn base_response(&self) -> &BaseResponse {
        &self.base_response
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct BatchContactResponse {
    pub base_response: BaseResponse,
    pub count: i64,
    pub contact_list: Vec<RawContact>,
}

impl ApiCall for BatchContactResponse {
    fn base_response(&self) -> &BaseResponse {
        &self.base_response
    }
}

/// Opaque long-poll cursor, round-tripped verbatim between sync calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SyncCursor {
    pub count: i64,
    pub list: Vec<SyncKeyItem>,
}

impl SyncCursor {
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SyncKeyItem {
    pub key: i64,
    pub val: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct InitResponse {
    pub base_response: BaseResponse,
    pub user: RawContact,
    #[serde(rename = "SKey", alias = "Skey")]
    pub skey: String,
    pub sync_key: SyncCursor,
}

impl ApiCall for InitResponse {
    fn base_response(&self) -> &BaseResponse {
        &self.base_response
    }

    fn rotated_skey(&self) -> Option<&str> {
        if self.skey.is_empty() {
            None
        } else {
            Some(&self.skey)
        }
    }
}

/// Envelope of one pushed message — only what routing and contact
/// resolution need; everything else rides along in `extra` untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct RawMessage {
    pub from_user_name: String,
    pub to_user_name: String,
    pub content: String,
    pub msg_type: i64,
    pub msg_id: String,
    pub has_product_id: i64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One long-poll push batch.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SyncResponse {
    pub base_response: BaseResponse,
    pub add_msg_count: i64,
    pub add_msg_list: Vec<RawMessage>,
    pub mod_contact_count: i64,
    pub mod_contact_list: Vec<RawContact>,
    pub del_contact_count: i64,
    pub del_contact_list: Vec<RawContact>,
    pub mod_chat_room_member_count: i64,
    pub mod_chat_room_member_list: Vec<RawContact>,
    pub sync_key: SyncCursor,
}

impl ApiCall for SyncResponse {
    fn base_response(&self) -> &BaseResponse {
        &self.base_response
    }
}

/// Identity pair for the batched group fetch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupQuery {
    pub user_name: String,
    pub chat_room_id: String,
}

/// Identity pair for the batched member-detail fetch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MemberQuery {
    pub user_name: String,
    #[serde(rename = "EncryChatRoomId")]
    pub encry_chat_room_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SendMsgResponse {
    pub base_response: BaseResponse,
    #[serde(rename = "MsgID")]
    pub msg_id: String,
    #[serde(rename = "LocalID")]
    pub local_id: String,
}

impl ApiCall for SendMsgResponse {
    fn base_response(&self) -> &BaseResponse {
        &self.base_response
    }
}
