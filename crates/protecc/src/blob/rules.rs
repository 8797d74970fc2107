use super::{
    PROTECC_BLOB_VERSION, PROTECC_MOUNT_PROFILE_MAGIC, PROTECC_NET_PROFILE_MAGIC, StringHeap,
    checked_size, heap_str, put_u16, put_u32, read_u16, read_u32,
};
use crate::error::{Error, Result};
use crate::mount::MountRule;
use crate::net::{NetFamily, NetProtocol, NetRule, RuleAction};

const HEADER_SIZE: usize = 20;
const NET_RULE_SIZE: usize = 16;
const MOUNT_RULE_SIZE: usize = 24;

fn assemble(magic: u32, count: usize, records: Vec<u8>, heap: StringHeap) -> Result<Vec<u8>> {
    let heap = heap.finish();
    let too_large = || Error::CompileFailed("rule blob exceeds 4 GiB".into());
    let count = u32::try_from(count).map_err(|_| too_large())?;
    let strings_size = u32::try_from(heap.len()).map_err(|_| too_large())?;
    let total = checked_size(&[(records.len(), 1), (heap.len(), 1)], HEADER_SIZE)
        .filter(|&total| u32::try_from(total).is_ok())
        .ok_or_else(too_large)?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(total)
        .map_err(|_| Error::OutOfMemory("allocating a rule blob"))?;
    put_u32(&mut buf, magic);
    put_u32(&mut buf, PROTECC_BLOB_VERSION);
    put_u32(&mut buf, 0);
    put_u32(&mut buf, count);
    put_u32(&mut buf, strings_size);
    buf.extend_from_slice(&records);
    buf.extend_from_slice(&heap);
    Ok(buf)
}

pub(crate) fn encode_net_rules(rules: &[NetRule]) -> Result<Vec<u8>> {
    let mut heap = StringHeap::default();
    let mut records = Vec::with_capacity(rules.len() * NET_RULE_SIZE);
    for rule in rules {
        rule.validate()?;
        records.extend_from_slice(&[
            rule.action as u8,
            rule.protocol as u8,
            rule.family as u8,
            0,
        ]);
        put_u16(&mut records, rule.port_from);
        put_u16(&mut records, rule.port_to);
        put_u32(&mut records, heap.add(rule.ip_pattern.as_deref())?);
        put_u32(&mut records, heap.add(rule.unix_path.as_deref())?);
    }
    assemble(PROTECC_NET_PROFILE_MAGIC, rules.len(), records, heap)
}

pub(crate) fn encode_mount_rules(rules: &[MountRule]) -> Result<Vec<u8>> {
    let mut heap = StringHeap::default();
    let mut records = Vec::with_capacity(rules.len() * MOUNT_RULE_SIZE);
    for rule in rules {
        rule.validate()?;
        records.extend_from_slice(&[rule.action as u8, 0, 0, 0]);
        put_u32(&mut records, rule.flags);
        for value in rule.strings() {
            put_u32(&mut records, heap.add(value.as_deref())?);
        }
    }
    assemble(PROTECC_MOUNT_PROFILE_MAGIC, rules.len(), records, heap)
}

#[derive(Debug, Clone, Copy)]
struct Section<'a> {
    count: usize,
    record_size: usize,
    records: &'a [u8],
    heap: &'a [u8],
}

impl<'a> Section<'a> {
    fn parse(bytes: &'a [u8], magic: u32, record_size: usize, what: &str) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::blob(format!("truncated {what} blob header")));
        }
        let found = read_u32(bytes, 0)?;
        if found != magic {
            return Err(Error::blob(format!("bad {what} blob magic {found:#010x}")));
        }
        let version = read_u32(bytes, 4)?;
        if version != PROTECC_BLOB_VERSION {
            return Err(Error::blob(format!("unsupported {what} blob version {version}")));
        }
        if read_u32(bytes, 8)? != 0 {
            return Err(Error::blob(format!("unknown {what} blob flags")));
        }
        let count = read_u32(bytes, 12)? as usize;
        let strings_size = read_u32(bytes, 16)? as usize;
        if strings_size % 4 != 0 {
            return Err(Error::blob("string heap is not 4-byte aligned"));
        }
        let records_end = checked_size(&[(count, record_size)], HEADER_SIZE)
            .ok_or_else(|| Error::blob("rule count overflows"))?;
        let total = records_end
            .checked_add(strings_size)
            .ok_or_else(|| Error::blob("string heap size overflows"))?;
        if total != bytes.len() {
            return Err(Error::blob(format!(
                "{what} blob sections need {total} bytes, blob has {}",
                bytes.len()
            )));
        }
        Ok(Self {
            count,
            record_size,
            records: &bytes[HEADER_SIZE..records_end],
            heap: &bytes[records_end..],
        })
    }

    fn record(&self, index: usize) -> &'a [u8] {
        let start = index * self.record_size;
        &self.records[start..start + self.record_size]
    }
}

/// Borrowed network rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetRuleView<'a> {
    pub action: RuleAction,
    pub protocol: NetProtocol,
    pub family: NetFamily,
    pub port_from: u16,
    pub port_to: u16,
    pub ip_pattern: Option<&'a str>,
    pub unix_path: Option<&'a str>,
}

impl NetRuleView<'_> {
    pub fn to_rule(&self) -> NetRule {
        NetRule {
            action: self.action,
            protocol: self.protocol,
            family: self.family,
            port_from: self.port_from,
            port_to: self.port_to,
            ip_pattern: self.ip_pattern.map(str::to_string),
            unix_path: self.unix_path.map(str::to_string),
        }
    }
}

fn decode_net<'a>(record: &[u8], heap: &'a [u8]) -> Result<NetRuleView<'a>> {
    let action = RuleAction::from_code(record[0])
        .ok_or_else(|| Error::blob(format!("unknown net action {}", record[0])))?;
    let protocol = NetProtocol::from_code(record[1])
        .ok_or_else(|| Error::blob(format!("unknown net protocol {}", record[1])))?;
    let family = NetFamily::from_code(record[2])
        .ok_or_else(|| Error::blob(format!("unknown net family {}", record[2])))?;
    if record[3] != 0 {
        return Err(Error::blob("net rule padding is not zero"));
    }
    let view = NetRuleView {
        action,
        protocol,
        family,
        port_from: read_u16(record, 4)?,
        port_to: read_u16(record, 6)?,
        ip_pattern: heap_str(heap, read_u32(record, 8)?)?,
        unix_path: heap_str(heap, read_u32(record, 12)?)?,
    };
    view.to_rule().check().map_err(Error::blob)?;
    Ok(view)
}

/// Validated, zero-copy view over a net blob.
#[derive(Debug, Clone, Copy)]
pub struct NetBlobView<'a> {
    section: Section<'a>,
}

impl<'a> NetBlobView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let section = Section::parse(bytes, PROTECC_NET_PROFILE_MAGIC, NET_RULE_SIZE, "net")?;
        for index in 0..section.count {
            decode_net(section.record(index), section.heap)
                .map_err(|err| Error::blob(format!("net rule {index}: {err}")))?;
        }
        Ok(Self { section })
    }

    pub fn len(&self) -> usize {
        self.section.count
    }

    pub fn is_empty(&self) -> bool {
        self.section.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = NetRuleView<'a>> + 'a {
        let section = self.section;
        (0..section.count).filter_map(move |index| decode_net(section.record(index), section.heap).ok())
    }

    pub fn to_rules(&self) -> Vec<NetRule> {
        self.iter().map(|view| view.to_rule()).collect()
    }
}

/// Borrowed mount rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountRuleView<'a> {
    pub action: RuleAction,
    pub flags: u32,
    pub source: Option<&'a str>,
    pub target: Option<&'a str>,
    pub fstype: Option<&'a str>,
    pub options: Option<&'a str>,
}

impl MountRuleView<'_> {
    pub fn to_rule(&self) -> MountRule {
        MountRule {
            action: self.action,
            flags: self.flags,
            source: self.source.map(str::to_string),
            target: self.target.map(str::to_string),
            fstype: self.fstype.map(str::to_string),
            options: self.options.map(str::to_string),
        }
    }
}

fn decode_mount<'a>(record: &[u8], heap: &'a [u8]) -> Result<MountRuleView<'a>> {
    let action = RuleAction::from_code(record[0])
        .ok_or_else(|| Error::blob(format!("unknown mount action {}", record[0])))?;
    if record[1..4] != [0, 0, 0] {
        return Err(Error::blob("mount rule padding is not zero"));
    }
    let string = |offset: usize| -> Result<Option<&'a str>> { heap_str(heap, read_u32(record, offset)?) };
    let view = MountRuleView {
        action,
        flags: read_u32(record, 4)?,
        source: string(8)?,
        target: string(12)?,
        fstype: string(16)?,
        options: string(20)?,
    };
    view.to_rule().check().map_err(Error::blob)?;
    Ok(view)
}

/// Validated, zero-copy view over a mount blob.
#[derive(Debug, Clone, Copy)]
pub struct MountBlobView<'a> {
    section: Section<'a>,
}

impl<'a> MountBlobView<'a> {
    pub fn new(bytes: &'a [u8]) -> Result<Self> {
        let section = Section::parse(bytes, PROTECC_MOUNT_PROFILE_MAGIC, MOUNT_RULE_SIZE, "mount")?;
        for index in 0..section.count {
            decode_mount(section.record(index), section.heap)
                .map_err(|err| Error::blob(format!("mount rule {index}: {err}")))?;
        }
        Ok(Self { section })
    }

    pub fn len(&self) -> usize {
        self.section.count
    }

    pub fn is_empty(&self) -> bool {
        self.section.count == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = MountRuleView<'a>> + 'a {
        let section = self.section;
        (0..section.count)
            .filter_map(move |index| decode_mount(section.record(index), section.heap).ok())
    }

    pub fn to_rules(&self) -> Vec<MountRule> {
        self.iter().map(|view| view.to_rule()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn unix_rule(family: NetFamily) -> NetRule {
        NetRule {
            action: RuleAction::Allow,
            protocol: NetProtocol::Unix,
            family,
            port_from: 0,
            port_to: 0,
            ip_pattern: None,
            unix_path: Some("/var/run/app.sock".into()),
        }
    }

    #[test]
    fn net_blob_layout_and_view() {
        let rules = vec![
            unix_rule(NetFamily::Any),
            NetRule::new(RuleAction::Deny, NetProtocol::Tcp, NetFamily::Ipv4)
                .with_ports(22, 22)
                .with_ip("10.0.0.*"),
        ];
        let blob = encode_net_rules(&rules).unwrap();
        assert_eq!(read_u32(&blob, 12).unwrap(), 2);
        let strings_size = read_u32(&blob, 16).unwrap() as usize;
        assert_eq!(blob.len(), HEADER_SIZE + 2 * NET_RULE_SIZE + strings_size);

        let view = NetBlobView::new(&blob).unwrap();
        let views: Vec<_> = view.iter().collect();
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].unix_path, Some("/var/run/app.sock"));
        assert_eq!(views[1].ip_pattern, Some("10.0.0.*"));
        assert_eq!(view.to_rules(), rules);
    }

    #[test]
    fn forged_unix_ipv4_rule_is_rejected_on_import() {
        let mut blob = encode_net_rules(&[unix_rule(NetFamily::Any)]).unwrap();
        // family byte of the first record
        blob[HEADER_SIZE + 2] = NetFamily::Ipv4 as u8;
        let err = NetBlobView::new(&blob).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidBlob);
    }

    #[test]
    fn string_offset_past_heap_is_rejected() {
        let mut blob = encode_net_rules(&[unix_rule(NetFamily::Unix)]).unwrap();
        let strings_size = read_u32(&blob, 16).unwrap();
        blob[HEADER_SIZE + 12..HEADER_SIZE + 16].copy_from_slice(&strings_size.to_le_bytes());
        assert_eq!(NetBlobView::new(&blob).unwrap_err().kind(), ErrorKind::InvalidBlob);
    }

    #[test]
    fn mount_blob_keeps_absent_strings() {
        let rules = vec![
            MountRule::new(RuleAction::Allow)
                .with_fstype("tmpfs")
                .with_target("/tmp"),
            MountRule::new(RuleAction::Audit).with_flags(7),
        ];
        let blob = encode_mount_rules(&rules).unwrap();
        assert_eq!(
            blob.len(),
            HEADER_SIZE + 2 * MOUNT_RULE_SIZE + read_u32(&blob, 16).unwrap() as usize
        );
        let view = MountBlobView::new(&blob).unwrap();
        assert_eq!(view.len(), 2);
        let first = view.iter().next().unwrap();
        assert_eq!(first.source, None);
        assert_eq!(first.fstype, Some("tmpfs"));
        assert_eq!(view.to_rules(), rules);
    }

    #[test]
    fn magic_mismatch_between_kinds() {
        let blob = encode_mount_rules(&[]).unwrap();
        assert!(NetBlobView::new(&blob).is_err());
        assert!(MountBlobView::new(&blob).unwrap().is_empty());
    }
}
