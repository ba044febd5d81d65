// Copyright 2024 Gantry project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bytes::{Bytes, BytesMut};
use prost::Message;

/// Extension methods on `prost::Message`.
pub trait MessageExt: Message + Sized {
    /// Serializes this message to `bytes::Bytes`.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)
            .expect("illegal state: encoded_len returned wrong length");
        buf.freeze()
    }
}

impl<M: Message> MessageExt for M {}
