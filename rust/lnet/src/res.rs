// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # User resources: event queues, MDs and MEs
//!
//! Resources are sharded over the partitions of the resource lock. EQs are
//! few and live in the shared section, which only changes under the
//! exclusive lock. MDs bound for active operations go to the caller's
//! partition. The portal table, every ME and every MD hanging off an ME
//! live in the last partition, which is where incoming messages are
//! matched.
//!
//! Unlinking an MD that operations still reference only turns it into a
//! zombie: user lookups fail right away, and the object goes once the last
//! message lets go of it.

use crate::api::LNet;
use crate::config::LnetConfig;
use crate::eq::Eq;
use crate::eq::EqCallback;
use crate::eq::EventQueue;
use crate::eq::PolledEvent;
use crate::error::LnetError;
use crate::error::LnetResult;
use crate::freelist::new_pool;
use crate::freelist::ObjPool;
use crate::handle::cookie_type;
use crate::handle::cpt_of_cookie;
use crate::handle::CookieType;
use crate::handle::EqHandle;
use crate::handle::HandleTable;
use crate::handle::MdHandle;
use crate::handle::MeHandle;
use crate::md::Md;
use crate::md::MdDesc;
use crate::md::Unlink;
use crate::md::MD_FLAG_AUTO_UNLINK;
use crate::md::MD_FLAG_ZOMBIE;
use crate::md::MD_MANAGE_REMOTE;
use crate::md::MD_MAX_SIZE;
use crate::md::MD_OP_GET;
use crate::md::MD_OP_PUT;
use crate::md::MD_TRUNCATE;
use crate::me::InsPos;
use crate::me::Me;
use crate::msg::Msg;
use crate::ptl::Portal;
use crate::ptl::PortalKind;
use crate::types::Hdr;
use crate::types::HdrBody;
use crate::types::ProcessId;
use cfs_utils::LockSel;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// What an incoming PUT or GET asks of the match lists.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MatchInfo {
    pub(crate) id: ProcessId,
    /// `MD_OP_PUT` or `MD_OP_GET`.
    pub(crate) op: u32,
    pub(crate) portal: usize,
    pub(crate) rlength: u32,
    pub(crate) roffset: u32,
    pub(crate) mbits: u64,
}

impl MatchInfo {
    pub(crate) fn of(hdr: &Hdr) -> Option<MatchInfo> {
        match hdr.body {
            HdrBody::Put {
                match_bits,
                ptl_index,
                offset,
                ..
            } => Some(MatchInfo {
                id: hdr.src(),
                op: MD_OP_PUT,
                portal: ptl_index as usize,
                rlength: hdr.payload_length,
                roffset: offset,
                mbits: match_bits,
            }),
            HdrBody::Get {
                match_bits,
                ptl_index,
                src_offset,
                sink_length,
                ..
            } => Some(MatchInfo {
                id: hdr.src(),
                op: MD_OP_GET,
                portal: ptl_index as usize,
                rlength: sink_length,
                roffset: src_offset,
                mbits: match_bits,
            }),
            _ => None,
        }
    }

    fn op_name(&self) -> &'static str {
        if self.op == MD_OP_PUT {
            "put"
        } else {
            "get"
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MatchResult {
    /// The message is attached to an MD.
    Ok,
    /// Nothing matched; a lazy portal may hold on to the PUT.
    None,
    /// Matched but not acceptable, or nothing matched on a strict portal.
    Drop,
}

pub(crate) struct ResShared {
    pub(crate) eqs: HandleTable<Box<Eq>>,
    eq_pool: Box<dyn ObjPool<Eq>>,
}

impl ResShared {
    pub(crate) fn new(config: &LnetConfig) -> ResShared {
        ResShared {
            eqs: HandleTable::new(CookieType::Eq, 0),
            eq_pool: new_pool(config.use_freelist, config.max_eqs),
        }
    }

    /// The queue an MD should post to. An invalid handle means no queue.
    fn eq_of(&self, eqh: EqHandle) -> LnetResult<Option<(EqHandle, Arc<EventQueue>)>> {
        if eqh.is_invalid() {
            return Ok(None);
        }
        match self.eqs.lookup(eqh.cookie()).and_then(|eq| eq.queue.clone()) {
            Some(queue) => Ok(Some((eqh, queue))),
            None => Err(LnetError::NotFound),
        }
    }
}

pub(crate) struct ResPart {
    pub(crate) cpt: usize,
    pub(crate) mds: HandleTable<Box<Md>>,
    pub(crate) mes: HandleTable<Box<Me>>,
    md_pool: Box<dyn ObjPool<Md>>,
    me_pool: Box<dyn ObjPool<Me>>,
    /// Only populated in the matching partition.
    pub(crate) portals: Vec<Portal>,
}

impl ResPart {
    pub(crate) fn new(cpt: usize, config: &LnetConfig, nportals: usize) -> ResPart {
        ResPart {
            cpt,
            mds: HandleTable::new(CookieType::Md, cpt),
            mes: HandleTable::new(CookieType::Me, cpt),
            md_pool: new_pool(config.use_freelist, config.max_mds),
            me_pool: new_pool(config.use_freelist, config.max_mes),
            portals: (0..nportals).map(Portal::new).collect(),
        }
    }

    fn md_link(
        &mut self,
        desc: &MdDesc,
        unlink: Unlink,
        eq: Option<(EqHandle, Arc<EventQueue>)>,
    ) -> LnetResult<u64> {
        let mut md = match self.md_pool.alloc() {
            Some(md) => md,
            None => return Err(LnetError::NoMem),
        };
        md.build(desc, unlink);
        if let Some((_, queue)) = &eq {
            queue.addref();
        }
        md.eq = eq;
        Ok(self.mds.insert(md))
    }

    /// Unlink an MD. It is detached from its ME (taking the ME along if
    /// the ME auto-unlinks) and hidden from users, and freed once no
    /// message references it.
    pub(crate) fn md_unlink(&mut self, cookie: u64) {
        let md = match self.mds.get_mut(cookie) {
            Some(md) => md,
            None => panic!("unlinking a freed MD {:#x}", cookie),
        };

        if !md.is_zombie() {
            md.flags |= MD_FLAG_ZOMBIE;
            let me = md.me.take();
            self.mds.invalidate(cookie);

            if let Some(me_cookie) = me {
                let unlink = match self.mes.get_mut(me_cookie) {
                    Some(me) => {
                        me.md = None;
                        me.unlink
                    }
                    None => panic!("MD {:#x} attached to a freed ME", cookie),
                };
                if unlink == Unlink::Unlink {
                    self.me_unlink(me_cookie);
                }
            }
        }

        let refcount = self.mds.get(cookie).map_or(0, |md| md.refcount);
        if refcount != 0 {
            log::debug!("Queueing unlink of md {:#x}", cookie);
            return;
        }

        log::debug!("Unlinking md {:#x}", cookie);
        if let Some(mut md) = self.mds.remove(cookie) {
            if let Some((_, queue)) = md.eq.take() {
                queue.decref();
            }
            self.md_pool.free(md);
        }
    }

    /// Take an ME off its portal and free it, unlinking its MD.
    pub(crate) fn me_unlink(&mut self, cookie: u64) {
        let me = match self.mes.remove(cookie) {
            Some(me) => me,
            None => panic!("unlinking a freed ME {:#x}", cookie),
        };
        if let Some(portal) = self.portals.get_mut(me.portal) {
            portal.detach(cookie, me.match_id, me.match_bits);
        }
        if let Some(md_cookie) = me.md {
            if let Some(md) = self.mds.get_mut(md_cookie) {
                md.me = None;
            }
            self.md_unlink(md_cookie);
        }
        self.me_pool.free(me);
    }

    /// Try the MD of one ME, attaching `msg` to it on a match.
    fn try_match_md(&mut self, me_cookie: u64, info: &MatchInfo, msg: &mut Msg) -> MatchResult {
        let (md_cookie, matched) = match self.mes.get(me_cookie) {
            Some(me) => match me.md {
                Some(md) => (md, me.matches(info.id, info.mbits)),
                None => return MatchResult::None,
            },
            None => panic!("portal lists a freed ME {:#x}", me_cookie),
        };
        let md = match self.mds.get_mut(md_cookie) {
            Some(md) => md,
            None => panic!("ME {:#x} holds a freed MD {:#x}", me_cookie, md_cookie),
        };

        if md.exhausted() || md.options & info.op == 0 || !matched {
            return MatchResult::None;
        }

        let offset = if md.options & MD_MANAGE_REMOTE == 0 {
            md.offset
        } else {
            info.roffset
        };
        let mut mlength = if md.options & MD_MAX_SIZE != 0 {
            md.max_size
        } else {
            md.length.saturating_sub(offset)
        };

        if info.rlength <= mlength {
            mlength = info.rlength;
        } else if md.options & MD_TRUNCATE == 0 {
            log::error!(
                "Matching packet from {}, match {} length {} too big: {} left, {} allowed",
                info.id,
                info.mbits,
                info.rlength,
                md.length.saturating_sub(offset),
                mlength
            );
            return MatchResult::Drop;
        }

        log::debug!(
            "Incoming {} index {:x} from {} of length {}/{} into md {:#x} [{}] + {}",
            info.op_name(),
            info.portal,
            info.id,
            mlength,
            info.rlength,
            md_cookie,
            md.memory.len(),
            offset
        );

        msg.attach_md(md_cookie, md, offset, mlength);
        md.offset = offset + mlength;

        // The message holds a reference, so this only flags the MD and
        // takes the ME along if it auto-unlinks.
        if md.exhausted() && md.flags & MD_FLAG_AUTO_UNLINK != 0 {
            self.md_unlink(md_cookie);
        }
        MatchResult::Ok
    }

    /// Walk the match list of the message's portal in order.
    pub(crate) fn match_md(&mut self, info: &MatchInfo, msg: &mut Msg) -> MatchResult {
        let candidates = match self.portals.get(info.portal) {
            Some(portal) => portal.candidates(info.id, info.mbits),
            None => {
                log::error!("Invalid portal {} from {}", info.portal, info.id);
                return MatchResult::Drop;
            }
        };

        for me in candidates {
            match self.try_match_md(me, info, msg) {
                MatchResult::None => continue,
                rc => return rc,
            }
        }

        if info.op == MD_OP_GET || !self.portals[info.portal].lazy {
            return MatchResult::Drop;
        }
        MatchResult::None
    }

    /// Offer the PUTs parked on a lazy portal to a freshly attached MD.
    /// Returns the PUTs that now have a home and those that must go.
    fn match_delayed(
        &mut self,
        pidx: usize,
        me_cookie: u64,
        md_cookie: u64,
    ) -> (Vec<Box<Msg>>, Vec<Box<Msg>>) {
        let mut matches = Vec::new();
        let mut drops = Vec::new();
        if !self.portals[pidx].lazy {
            assert!(self.portals[pidx].delayed.is_empty());
            return (matches, drops);
        }

        let mut pending = std::mem::take(&mut self.portals[pidx].delayed);
        let mut keep = VecDeque::new();
        while let Some(mut msg) = pending.pop_front() {
            assert!(msg.delayed);
            let info = match MatchInfo::of(&msg.hdr) {
                Some(info) => info,
                None => panic!("delayed {} is not a PUT", msg.hdr),
            };
            match self.try_match_md(me_cookie, &info, &mut msg) {
                MatchResult::None => {
                    keep.push_back(msg);
                    continue;
                }
                MatchResult::Ok => {
                    log::debug!(
                        "Resuming delayed PUT from {} portal {} match {} offset {} length {}.",
                        info.id,
                        info.portal,
                        info.mbits,
                        info.roffset,
                        info.rlength
                    );
                    matches.push(msg);
                }
                MatchResult::Drop => drops.push(msg),
            }
            if self.mds.get(md_cookie).map_or(true, |md| md.exhausted()) {
                break;
            }
        }
        keep.extend(pending);
        self.portals[pidx].delayed = keep;
        (matches, drops)
    }
}

impl LNet {
    /// Partition holding the portal table and the match lists.
    pub(crate) fn match_cpt(&self) -> usize {
        self.res.number() - 1
    }

    pub(crate) fn res_cpt_of(&self, cookie: u64, kind: CookieType) -> LnetResult<usize> {
        if cookie_type(cookie) != Some(kind) {
            return Err(LnetError::NotFound);
        }
        let cpt = cpt_of_cookie(cookie);
        if cpt >= self.res.number() {
            return Err(LnetError::NotFound);
        }
        Ok(cpt)
    }

    /// Create an event queue. `count` is rounded up to a power of two; a
    /// queue with a callback may have no ring at all.
    pub fn eq_alloc(&self, count: usize, callback: Option<EqCallback>) -> LnetResult<EqHandle> {
        if callback.is_some() && count != 0 {
            log::warn!(
                "EQ callback is guaranteed to get every event, polling with eqcount {} adds locking overhead",
                count
            );
        }
        let queue = match EventQueue::new(count, callback, self.eq_waitq.clone()) {
            Some(queue) => queue,
            None => return Err(LnetError::Invalid),
        };

        let mut res = self.res.lock_exclusive();
        let shared = res.shared_mut();
        let mut eq = match shared.eq_pool.alloc() {
            Some(eq) => eq,
            None => return Err(LnetError::NoMem),
        };
        eq.queue = Some(Arc::new(queue));
        Ok(EqHandle::from_cookie(shared.eqs.insert(eq)))
    }

    /// Free an event queue no MD points at any more.
    pub fn eq_free(&self, eqh: EqHandle) -> LnetResult<()> {
        let mut res = self.res.lock_exclusive();
        let shared = res.shared_mut();
        let refs = match shared.eqs.lookup(eqh.cookie()) {
            Some(eq) => eq.queue.as_ref().map_or(0, |q| q.refs()),
            None => return Err(LnetError::NotFound),
        };
        if refs != 0 {
            log::debug!("Event queue {:?} busy on destroy: {} MDs", eqh, refs);
            return Err(LnetError::Busy);
        }
        shared.eqs.invalidate(eqh.cookie());
        if let Some(eq) = shared.eqs.remove(eqh.cookie()) {
            shared.eq_pool.free(eq);
        }
        Ok(())
    }

    /// Next event of one queue without blocking.
    pub fn eq_get(&self, eqh: EqHandle) -> LnetResult<Option<PolledEvent>> {
        self.eq_poll(&[eqh], Some(Duration::ZERO))
    }

    /// Block until one queue has an event.
    pub fn eq_wait(&self, eqh: EqHandle) -> LnetResult<PolledEvent> {
        loop {
            if let Some(ev) = self.eq_poll(&[eqh], None)? {
                return Ok(ev);
            }
        }
    }

    /// First event found scanning `handles` in order, waiting up to
    /// `timeout` (forever with `None`) for one to show up.
    pub fn eq_poll(
        &self,
        handles: &[EqHandle],
        timeout: Option<Duration>,
    ) -> LnetResult<Option<PolledEvent>> {
        if handles.is_empty() {
            return Err(LnetError::NotFound);
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let seen = self.eq_waitq.generation();
            let queues = {
                let res = self.res.read(LockSel::Current);
                handles
                    .iter()
                    .map(|h| {
                        res.shared()
                            .eqs
                            .lookup(h.cookie())
                            .and_then(|eq| eq.queue.clone())
                            .ok_or(LnetError::NotFound)
                    })
                    .collect::<LnetResult<Vec<_>>>()?
            };

            for (which, queue) in queues.iter().enumerate() {
                if let Some((event, overflowed)) = queue.dequeue() {
                    return Ok(Some(PolledEvent {
                        which,
                        event,
                        overflowed,
                    }));
                }
            }

            if !self.eq_waitq.wait(seen, deadline) {
                return Ok(None);
            }
        }
    }

    /// Create a free-floating MD for an active PUT or GET.
    pub fn md_bind(&self, desc: &MdDesc, unlink: Unlink) -> LnetResult<MdHandle> {
        desc.validate()?;
        if desc.options & (MD_OP_GET | MD_OP_PUT) != 0 {
            log::error!("Invalid option: GET|PUT illegal on active MDs");
            return Err(LnetError::Invalid);
        }

        let mut res = self.res.lock(LockSel::Current);
        let (shared, part) = res.split_mut();
        let eq = shared.eq_of(desc.eq)?;
        let cookie = part.md_link(desc, unlink, eq)?;
        Ok(MdHandle::from_cookie(cookie))
    }

    /// Attach an MD to an ME that has none, then hand it any PUT parked
    /// on the portal that it matches.
    pub fn md_attach(&self, meh: MeHandle, desc: &MdDesc, unlink: Unlink) -> LnetResult<MdHandle> {
        desc.validate()?;
        if desc.options & (MD_OP_GET | MD_OP_PUT) == 0 {
            log::error!("Invalid option: no MD_OP set");
            return Err(LnetError::Invalid);
        }
        let cpt = self.res_cpt_of(meh.cookie(), CookieType::Me)?;

        let (cookie, matches, drops) = {
            let mut res = self.res.lock(LockSel::Cpt(cpt));
            let (shared, part) = res.split_mut();
            let pidx = match part.mes.lookup(meh.cookie()) {
                Some(me) if me.md.is_some() => return Err(LnetError::Busy),
                Some(me) => me.portal,
                None => return Err(LnetError::NotFound),
            };
            let eq = shared.eq_of(desc.eq)?;
            let cookie = part.md_link(desc, unlink, eq)?;
            if let Some(me) = part.mes.get_mut(meh.cookie()) {
                me.md = Some(cookie);
            }
            if let Some(md) = part.mds.get_mut(cookie) {
                md.me = Some(meh.cookie());
            }
            let (matches, drops) = part.match_delayed(pidx, meh.cookie(), cookie);
            (cookie, matches, drops)
        };

        self.drop_delayed_puts(drops, "Bad match");
        for msg in matches {
            self.recv_delayed_put(msg);
        }
        Ok(MdHandle::from_cookie(cookie))
    }

    /// Unlink an MD. An idle MD posts an unlink event right away; a busy
    /// one reports it in the completion event of its last operation.
    pub fn md_unlink(&self, mdh: MdHandle) -> LnetResult<()> {
        let cpt = self.res_cpt_of(mdh.cookie(), CookieType::Md)?;
        let post = {
            let mut res = self.res.lock(LockSel::Cpt(cpt));
            let md = match res.mds.lookup(mdh.cookie()) {
                Some(md) => md,
                None => return Err(LnetError::NotFound),
            };
            let post = match &md.eq {
                Some((_, queue)) if md.refcount == 0 => {
                    Some((queue.clone(), md.unlink_event(mdh)))
                }
                _ => None,
            };
            res.md_unlink(mdh.cookie());
            post
        };

        if let Some((queue, ev)) = post {
            queue.enqueue(ev);
        }
        Ok(())
    }

    /// Add an ME at the head or tail of a portal's match list. The first
    /// ME decides whether the portal matches unique or wildcard entries;
    /// an ME of the other kind is refused.
    pub fn me_attach(
        &self,
        portal: usize,
        match_id: ProcessId,
        match_bits: u64,
        ignore_bits: u64,
        unlink: Unlink,
        pos: InsPos,
    ) -> LnetResult<MeHandle> {
        let mut res = self.res.lock(LockSel::Cpt(self.match_cpt()));
        let part = &mut *res;
        match part.portals.get_mut(portal) {
            Some(ptl) => {
                if !ptl.type_match(match_id, ignore_bits) {
                    return Err(LnetError::Perm);
                }
            }
            None => return Err(LnetError::Invalid),
        }

        let mut me = match part.me_pool.alloc() {
            Some(me) => me,
            None => return Err(LnetError::NoMem),
        };
        *me = Me {
            portal,
            match_id,
            match_bits,
            ignore_bits,
            unlink,
            md: None,
        };
        let cookie = part.mes.insert(me);
        part.portals[portal].attach(cookie, match_id, match_bits, pos);
        Ok(MeHandle::from_cookie(cookie))
    }

    /// Add an ME right before or after another one. Not allowed on a
    /// unique portal, where list order means nothing.
    pub fn me_insert(
        &self,
        current: MeHandle,
        match_id: ProcessId,
        match_bits: u64,
        ignore_bits: u64,
        unlink: Unlink,
        pos: InsPos,
    ) -> LnetResult<MeHandle> {
        let cpt = self.res_cpt_of(current.cookie(), CookieType::Me)?;
        let mut res = self.res.lock(LockSel::Cpt(cpt));
        let part = &mut *res;

        let pidx = match part.mes.lookup(current.cookie()) {
            Some(me) => me.portal,
            None => return Err(LnetError::NotFound),
        };
        if part.portals[pidx].kind() == PortalKind::Unique {
            return Err(LnetError::Perm);
        }

        let mut me = match part.me_pool.alloc() {
            Some(me) => me,
            None => return Err(LnetError::NoMem),
        };
        *me = Me {
            portal: pidx,
            match_id,
            match_bits,
            ignore_bits,
            unlink,
            md: None,
        };
        let cookie = part.mes.insert(me);
        if !part.portals[pidx].insert_near(cookie, match_id, match_bits, current.cookie(), pos) {
            if let Some(me) = part.mes.remove(cookie) {
                part.me_pool.free(me);
            }
            return Err(LnetError::Invalid);
        }
        Ok(MeHandle::from_cookie(cookie))
    }

    /// Unlink an ME and its MD, if any.
    pub fn me_unlink(&self, meh: MeHandle) -> LnetResult<()> {
        let cpt = self.res_cpt_of(meh.cookie(), CookieType::Me)?;
        let post = {
            let mut res = self.res.lock(LockSel::Cpt(cpt));
            let md_cookie = match res.mes.lookup(meh.cookie()) {
                Some(me) => me.md,
                None => return Err(LnetError::NotFound),
            };
            let post = md_cookie.and_then(|c| {
                let md = res.mds.get(c)?;
                match &md.eq {
                    Some((_, queue)) if md.refcount == 0 => Some((
                        queue.clone(),
                        md.unlink_event(MdHandle::from_cookie(c)),
                    )),
                    _ => None,
                }
            });
            res.me_unlink(meh.cookie());
            post
        };

        if let Some((queue, ev)) = post {
            queue.enqueue(ev);
        }
        Ok(())
    }

    /// Number of live MDs, MEs and EQs, for leak reports.
    pub(crate) fn res_counts(&self) -> (usize, usize, usize) {
        let res = self.res.lock_exclusive();
        let mut mds = 0;
        let mut mes = 0;
        for cpt in 0..res.number() {
            mds += res.part(cpt).mds.len();
            mes += res.part(cpt).mes.len();
        }
        (mds, mes, res.shared().eqs.len())
    }
}
