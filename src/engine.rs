//! Request dispatcher.
//!
//! `Se3Core` owns the flash store, the session arena and the device clock.
//! Requests run one at a time to completion; `&mut self` on every mutating
//! operation keeps a second request from starting while one is in flight.

use log::{debug, warn};

use crate::algo::{self, AlgoInfo, Update, flags};
use crate::error::{Error, Result, status};
use crate::flash::FlashStore;
use crate::flash::device::FlashDevice;
use crate::keys::{self, KEY_INVALID, Key, KeyInfo};
use crate::proto::{
    self, CryptoInitReq, CryptoInitResp, CryptoUpdateReq, KeyEditReq, KeyListReq, KeyOp,
    REQ_MAX_DATA, SetTimeReq, cmd,
};
use crate::records::{self, RECORD_SIZE};
use crate::session::{SessionConfig, SessionTable};

pub struct Se3Core<F> {
    store: FlashStore<F>,
    sessions: SessionTable,
    time: u32,
}

impl<F: FlashDevice> Se3Core<F> {
    /// Mounts the flash store on `device`.
    pub fn new(device: F, config: SessionConfig) -> Result<Self> {
        Ok(Self {
            store: FlashStore::mount(device)?,
            sessions: SessionTable::new(config),
            time: 0,
        })
    }

    pub fn store(&self) -> &FlashStore<F> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn into_device(self) -> F {
        self.store.into_device()
    }

    /// Device time, zero until the host sets it.
    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn crypto_set_time(&mut self, devtime: u32) {
        self.time = devtime;
    }

    /// Opens a session and returns its id.
    pub fn crypto_init(&mut self, algo_id: u16, mode: u16, key_id: u32) -> Result<u32> {
        let desc = algo::descriptor(algo_id)?;
        let init = desc.init.ok_or(Error::Params("algorithm has no init"))?;

        let key = if key_id == KEY_INVALID {
            None
        } else {
            Some(self.resolve_key(key_id)?)
        };
        let key_data = key.as_ref().map(Key::data).unwrap_or(&[]);

        let sid = self.sessions.reserve(desc.context_size)?;
        match init(key_data, mode) {
            Ok(ctx) => {
                self.sessions.commit(sid, algo_id, ctx)?;
                Ok(sid)
            }
            Err(e) => {
                self.sessions.free(sid)?;
                debug!("init of {} failed: {e}", desc.info.name);
                Err(e)
            }
        }
    }

    /// Runs one update. A FINIT request frees the session whatever the
    /// handler returned.
    pub fn crypto_update(
        &mut self,
        sid: u32,
        update_flags: u16,
        datain1: &[u8],
        datain2: &[u8],
    ) -> Result<Vec<u8>> {
        let session = self.sessions.get_mut(sid)?;
        let update = algo::descriptor(session.algo)?
            .update
            .ok_or(Error::Params("algorithm has no update"))?;

        let req = Update {
            flags: update_flags,
            datain1,
            datain2,
        };
        let mut out = Vec::new();
        let result = update(&mut session.ctx, &req, &mut out);

        if req.has(flags::FINIT) {
            self.sessions.free(sid)?;
        }
        result?;
        Ok(out)
    }

    pub fn crypto_list(&self) -> Vec<&'static AlgoInfo> {
        algo::list().collect()
    }

    pub fn key_edit(&mut self, req: &KeyEditReq<'_>) -> Result<()> {
        match req.op {
            KeyOp::Insert => {
                let key = Key::new(req.id, req.validity, req.data, req.name)?;
                keys::insert_key(&mut self.store, &key)
            }
            KeyOp::Upsert => {
                let key = Key::new(req.id, req.validity, req.data, req.name)?;
                keys::upsert_key(&mut self.store, &key)
            }
            KeyOp::Delete => keys::delete_key(&mut self.store, req.id),
        }
    }

    pub fn key_list(&self, skip: u16, max: u16, salt: &[u8]) -> Result<Vec<KeyInfo>> {
        keys::list_keys(&self.store, usize::from(skip), usize::from(max), salt)
    }

    pub fn record_get(&self, kind: u16) -> Result<Option<zeroize::Zeroizing<[u8; RECORD_SIZE]>>> {
        records::record_get(&self.store, kind)
    }

    pub fn record_set(&mut self, kind: u16, data: &[u8; RECORD_SIZE]) -> Result<()> {
        records::record_set(&mut self.store, kind, data)
    }

    /// Decodes a wire request, runs it and encodes the reply.
    ///
    /// Failures produce their status code and an empty body.
    pub fn handle(&mut self, command: u16, req: &[u8]) -> (u16, Vec<u8>) {
        match self.dispatch(command, req) {
            Ok(resp) => (status::OK, resp),
            Err(e) => {
                debug!("command {command} failed: {e}");
                (e.status(), Vec::new())
            }
        }
    }

    fn dispatch(&mut self, command: u16, req: &[u8]) -> Result<Vec<u8>> {
        if req.len() > REQ_MAX_DATA {
            return Err(Error::Params("request too large"));
        }
        match command {
            cmd::CRYPTO_INIT => {
                let r = CryptoInitReq::from_bytes(req)?;
                let sid = self.crypto_init(r.algo, r.mode, r.key_id)?;
                Ok(CryptoInitResp { sid }.to_bytes())
            }
            cmd::CRYPTO_UPDATE => {
                let r = CryptoUpdateReq::from_bytes(req)?;
                let out = self.crypto_update(r.sid, r.flags, r.datain1, r.datain2)?;
                proto::encode_update_resp(&out)
            }
            cmd::CRYPTO_LIST => Ok(proto::encode_algo_list(algo::list())),
            cmd::CRYPTO_SET_TIME => {
                let r = SetTimeReq::from_bytes(req)?;
                self.crypto_set_time(r.devtime);
                Ok(Vec::new())
            }
            cmd::KEY_EDIT => {
                let r = KeyEditReq::from_bytes(req)?;
                self.key_edit(&r)?;
                Ok(Vec::new())
            }
            cmd::KEY_LIST => {
                let r = KeyListReq::from_bytes(req)?;
                let keys = self.key_list(r.skip, r.max, &r.salt)?;
                Ok(proto::encode_key_list(&keys))
            }
            other => Err(Error::Command(other)),
        }
    }

    fn resolve_key(&self, key_id: u32) -> Result<Key> {
        let key = keys::load_key(&self.store, key_id)?.ok_or(Error::Resource("key not found"))?;
        if self.time != 0 && key.validity() < self.time {
            warn!("key {key_id:#010x} expired at {}", key.validity());
            return Err(Error::Expired(key_id));
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{id, mode};
    use crate::crypto::{DIGEST_LEN, verify_tag};
    use crate::flash::device::RamFlash;

    fn core() -> Se3Core<RamFlash> {
        Se3Core::new(RamFlash::new(), SessionConfig::default()).unwrap()
    }

    fn add_key(core: &mut Se3Core<RamFlash>, id: u32, validity: u32, data: &[u8]) {
        let req = KeyEditReq {
            op: KeyOp::Insert,
            id,
            validity,
            data,
            name: b"",
        };
        core.key_edit(&req).unwrap();
    }

    #[test]
    fn sha256_session_scenario() {
        let mut core = core();
        let sid = core.crypto_init(id::SHA256, 0, KEY_INVALID).unwrap();
        assert_eq!(sid, 0);
        assert!(core.crypto_update(sid, 0, b"abc", &[]).unwrap().is_empty());
        let digest = core.crypto_update(sid, flags::FINIT, &[], &[]).unwrap();
        assert_eq!(
            hex::encode(digest),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(matches!(core.crypto_update(sid, 0, b"x", &[]), Err(Error::Resource(_))));
    }

    #[test]
    fn sha256_scenario_over_the_wire() {
        let mut core = core();
        let init = CryptoInitReq {
            algo: id::SHA256,
            mode: 0,
            key_id: KEY_INVALID,
        };
        let (st, resp) = core.handle(cmd::CRYPTO_INIT, &init.to_bytes());
        assert_eq!(st, status::OK);
        let sid = CryptoInitResp::from_bytes(&resp).unwrap().sid;

        let upd = CryptoUpdateReq {
            sid,
            flags: flags::FINIT,
            datain1: b"abc",
            datain2: &[],
        };
        let (st, resp) = core.handle(cmd::CRYPTO_UPDATE, &upd.to_bytes());
        assert_eq!(st, status::OK);
        assert_eq!(
            hex::encode(proto::decode_update_resp(&resp).unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn failed_init_releases_the_slot() {
        let mut core = core();
        assert!(matches!(
            core.crypto_init(id::HMACSHA256, 0, KEY_INVALID),
            Err(Error::Params(_))
        ));
        assert_eq!(core.sessions().active(), 0);
        assert_eq!(core.sessions().memory_in_use(), 0);
        assert_eq!(core.crypto_init(id::SHA256, 0, KEY_INVALID).unwrap(), 0);
    }

    #[test]
    fn exhausting_the_arena_is_memory_error_and_ids_are_reused() {
        let mut core = Se3Core::new(
            RamFlash::new(),
            SessionConfig {
                max_sessions: 3,
                memory: 1 << 20,
            },
        )
        .unwrap();
        for expected in 0..3 {
            assert_eq!(core.crypto_init(id::SHA256, 0, KEY_INVALID).unwrap(), expected);
        }
        assert!(matches!(
            core.crypto_init(id::SHA256, 0, KEY_INVALID),
            Err(Error::Memory(_))
        ));

        core.crypto_update(1, flags::FINIT, &[], &[]).unwrap();
        assert_eq!(core.crypto_init(id::SHA256, 0, KEY_INVALID).unwrap(), 1);
    }

    #[test]
    fn finit_frees_even_when_the_handler_fails() {
        let mut core = core();
        add_key(&mut core, 1, u32::MAX, &[0u8; 16]);
        let sid = core.crypto_init(id::AES, mode::CBC | mode::ENCRYPT, 1).unwrap();
        assert!(matches!(
            core.crypto_update(sid, flags::FINIT, &[], &[0u8; 5]),
            Err(Error::Params(_))
        ));
        assert_eq!(core.sessions().active(), 0);
    }

    #[test]
    fn missing_and_expired_keys() {
        let mut core = core();
        assert!(matches!(
            core.crypto_init(id::AES, mode::ECB | mode::ENCRYPT, 7),
            Err(Error::Resource(_))
        ));

        add_key(&mut core, 7, 1000, &[1u8; 16]);
        assert!(core.crypto_init(id::AES, mode::ECB | mode::ENCRYPT, 7).is_ok());

        core.crypto_set_time(1001);
        assert!(matches!(
            core.crypto_init(id::AES, mode::ECB | mode::ENCRYPT, 7),
            Err(Error::Expired(7))
        ));
        assert_eq!(core.sessions().active(), 1);
    }

    #[test]
    fn composite_sessions_authenticate_through_the_core() {
        let mut core = core();
        add_key(&mut core, 2, u32::MAX, &[0x5Au8; 32]);
        let iv = [9u8; 16];
        let plain = [0x33u8; 48];

        let enc = core
            .crypto_init(id::AES_HMACSHA256, mode::CTR | mode::ENCRYPT, 2)
            .unwrap();
        let out = core
            .crypto_update(enc, flags::RESET | flags::AUTH | flags::FINIT, &iv, &plain)
            .unwrap();
        let (ct, tag) = out.split_at(plain.len());

        let dec = core
            .crypto_init(id::AES_HMACSHA256, mode::CTR | mode::DECRYPT, 2)
            .unwrap();
        let out = core
            .crypto_update(dec, flags::RESET | flags::AUTH | flags::FINIT, &iv, ct)
            .unwrap();
        let (back, dec_tag) = out.split_at(plain.len());
        assert_eq!(back, plain);
        assert_eq!(dec_tag.len(), DIGEST_LEN);
        verify_tag(tag, dec_tag).unwrap();
    }

    #[test]
    fn unknown_command_and_algorithm() {
        let mut core = core();
        assert_eq!(core.handle(0x77, &[]).0, status::COMMAND);
        let init = CryptoInitReq {
            algo: 5,
            mode: 0,
            key_id: KEY_INVALID,
        };
        assert_eq!(core.handle(cmd::CRYPTO_INIT, &init.to_bytes()).0, status::PARAMS);
        assert_eq!(core.handle(cmd::CRYPTO_INIT, &[1, 0]).0, status::PARAMS);
        assert_eq!(
            core.handle(cmd::CRYPTO_LIST, &vec![0u8; REQ_MAX_DATA + 1]).0,
            status::PARAMS
        );
    }

    #[test]
    fn list_over_the_wire() {
        let mut core = core();
        let (st, resp) = core.handle(cmd::CRYPTO_LIST, &[]);
        assert_eq!(st, status::OK);
        let names: Vec<_> = proto::decode_algo_list(&resp)
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, ["AES", "SHA256", "HMACSHA256", "AES_HMACSHA256"]);
        assert_eq!(core.crypto_list().len(), 4);
    }

    #[test]
    fn key_edit_and_list_over_the_wire() {
        let mut core = core();
        for (id, data) in [(10u32, [1u8; 16]), (11, [2u8; 16])] {
            let req = KeyEditReq {
                op: KeyOp::Upsert,
                id,
                validity: 50,
                data: &data,
                name: b"wire",
            };
            assert_eq!(core.handle(cmd::KEY_EDIT, &req.to_bytes()).0, status::OK);
        }
        let del = KeyEditReq {
            op: KeyOp::Delete,
            id: 10,
            validity: 0,
            data: &[],
            name: &[],
        };
        assert_eq!(core.handle(cmd::KEY_EDIT, &del.to_bytes()).0, status::OK);
        assert_eq!(core.handle(cmd::KEY_EDIT, &del.to_bytes()).0, status::RESOURCE);

        let list = KeyListReq {
            skip: 0,
            max: 10,
            salt: [0u8; 32],
        };
        let (st, resp) = core.handle(cmd::KEY_LIST, &list.to_bytes());
        assert_eq!(st, status::OK);
        let keys = proto::decode_key_list(&resp).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].id, 11);
        assert_eq!(keys[0].name, b"wire");
    }

    #[test]
    fn set_time_over_the_wire() {
        let mut core = core();
        let req = SetTimeReq { devtime: 1234 };
        assert_eq!(core.handle(cmd::CRYPTO_SET_TIME, &req.to_bytes()).0, status::OK);
        assert_eq!(core.time(), 1234);
    }

    #[test]
    fn state_survives_reboot() {
        let mut core = core();
        add_key(&mut core, 3, u32::MAX, &[4u8; 24]);
        core.record_set(0, &[8u8; RECORD_SIZE]).unwrap();

        let image = core.into_device().image().to_vec();
        let core =
            Se3Core::new(RamFlash::from_image(image).unwrap(), SessionConfig::default()).unwrap();
        assert_eq!(core.key_list(0, 5, &[]).unwrap()[0].id, 3);
        assert_eq!(*core.record_get(0).unwrap().unwrap(), [8u8; RECORD_SIZE]);
    }
}
