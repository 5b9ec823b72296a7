//! Opcode and flag tables
//!
//! The numeric values are fixed by the binary protocol and must never change.

/// Packet magic byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Magic {
    Request = 0x80,
    Response = 0x81,
}

impl Magic {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x80 => Some(Magic::Request),
            0x81 => Some(Magic::Response),
            _ => None,
        }
    }
}

code_table! {
    /// Command opcodes
    pub enum Opcode: u8 {
        Get = 0x00,
        Set = 0x01,
        Add = 0x02,
        Replace = 0x03,
        Delete = 0x04,
        Increment = 0x05,
        Decrement = 0x06,
        Append = 0x0e,
        Prepend = 0x0f,
        Stat = 0x10,
        Touch = 0x1c,
        GetAndTouch = 0x1d,
        Hello = 0x1f,
        SaslListMechs = 0x20,
        SaslAuth = 0x21,
        SaslStep = 0x22,
        GetAllVbSeqnos = 0x48,
        DcpOpenConnection = 0x50,
        DcpAddStream = 0x51,
        DcpCloseStream = 0x52,
        DcpStreamReq = 0x53,
        DcpGetFailoverLog = 0x54,
        DcpStreamEnd = 0x55,
        DcpSnapshotMarker = 0x56,
        DcpMutation = 0x57,
        DcpDeletion = 0x58,
        DcpExpiration = 0x59,
        DcpFlush = 0x5a,
        DcpSetVbucketState = 0x5b,
        DcpNoop = 0x5c,
        DcpBufferAck = 0x5d,
        DcpControl = 0x5e,
        GetReplica = 0x83,
        SelectBucket = 0x89,
        ObserveSeqNo = 0x91,
        Observe = 0x92,
        GetLocked = 0x94,
        UnlockKey = 0x95,
        SetMeta = 0xa2,
        DelMeta = 0xa8,
        GetClusterConfig = 0xb5,
        GetRandom = 0xb6,
        SubDocGet = 0xc5,
        SubDocExists = 0xc6,
        SubDocDictAdd = 0xc7,
        SubDocDictSet = 0xc8,
        SubDocDelete = 0xc9,
        SubDocReplace = 0xca,
        SubDocArrayPushLast = 0xcb,
        SubDocArrayPushFirst = 0xcc,
        SubDocArrayInsert = 0xcd,
        SubDocArrayAddUnique = 0xce,
        SubDocCounter = 0xcf,
        SubDocMultiLookup = 0xd0,
        SubDocMultiMutation = 0xd1,
        SubDocGetCount = 0xd2,
        GetErrorMap = 0xfe,
    }
}

impl Opcode {
    /// Whether the opcode addresses a single key (and so needs a vbucket)
    pub fn is_key_based(self) -> bool {
        !matches!(
            self,
            Opcode::Stat
                | Opcode::Hello
                | Opcode::SaslListMechs
                | Opcode::SaslAuth
                | Opcode::SaslStep
                | Opcode::SelectBucket
                | Opcode::GetClusterConfig
                | Opcode::GetRandom
                | Opcode::GetErrorMap
                | Opcode::Observe
        )
    }
}

code_table! {
    /// Features negotiated with HELLO
    pub enum HelloFeature: u16 {
        Datatype = 0x01,
        Tls = 0x02,
        TcpNoDelay = 0x03,
        SeqNo = 0x04,
        TcpDelay = 0x05,
        Xattr = 0x06,
        Xerror = 0x07,
        SelectBucket = 0x08,
        Collections = 0x09,
        Snappy = 0x0a,
        Json = 0x0b,
    }
}

/// Datatype flag: the value is JSON
pub const DATATYPE_JSON: u8 = 0x01;

/// Datatype flag: the value is compressed
pub const DATATYPE_COMPRESSED: u8 = 0x02;

/// Datatype flag: the value carries extended attributes
pub const DATATYPE_XATTR: u8 = 0x04;

/// State of a vbucket on a particular server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VbucketState {
    Active = 0x01,
    Replica = 0x02,
    Pending = 0x03,
    Dead = 0x04,
}
