use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tempfile::TempDir;

use fif::properties::Properties;
use fif::stream::{StaticKeyProvider, StreamType};
use fif::zip::reader::{read_central_directory, resolve_data_offset};
use fif::zip::writer::{write_central_directory, write_data_descriptor, write_local_header};
use fif::zip::{dos_datetime, CompressionMethod, EntryInfo, FLAG_DATA_DESCRIPTOR};
use fif::{Error, VolumeSet};

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Hand-build a standalone volume with explicit member timestamps — the
/// override and tombstone rules key on them.
fn build_volume(path: &Path, uuid: &str, members: &[(&str, &[u8], (u16, u16))]) {
    let mut f = File::create(path).unwrap();
    let mut entries = Vec::new();
    let mut pos = 0u64;

    let props = format!("UUID={uuid}\nversion=FIF 1.0\n");
    let stamp = dos_datetime(2009, 1, 1, 0, 0, 0);
    let mut all: Vec<(&str, Vec<u8>, (u16, u16))> =
        vec![("properties", props.into_bytes(), stamp)];
    for &(name, data, dos) in members {
        all.push((name, data.to_vec(), dos));
    }

    for (name, data, dos) in &all {
        let header_len =
            write_local_header(&mut f, name, CompressionMethod::Stored, *dos).unwrap();
        f.write_all(data).unwrap();
        let crc = crc32fast::hash(data);
        write_data_descriptor(&mut f, crc, data.len() as u64, data.len() as u64).unwrap();
        entries.push(EntryInfo {
            name:              (*name).to_string(),
            method:            CompressionMethod::Stored,
            crc32:             crc,
            compressed_size:   data.len() as u64,
            uncompressed_size: data.len() as u64,
            header_offset:     pos,
            flags:             FLAG_DATA_DESCRIPTOR,
            dos_date:          dos.0,
            dos_time:          dos.1,
        });
        pos += header_len + data.len() as u64 + 12;
    }
    write_central_directory(&mut f, &entries, pos).unwrap();
}

fn image_props(chunk_size: u64) -> Properties {
    let mut p = Properties::new();
    p.set("chunk_size", chunk_size.to_string());
    p
}

// ── Scenario 1 + P1: image round trips ───────────────────────────────────────

#[test]
fn image_stream_round_trip_with_tiny_chunks() {
    let dir = TempDir::new().unwrap();
    let vol = dir.path().join("a.zip");

    {
        let set = VolumeSet::new();
        set.create_new_volume(&vol).unwrap();
        let mut s = set
            .create_stream_for_writing("data", StreamType::Image, image_props(4))
            .unwrap();
        s.write(b"Hello, World!").unwrap();
        s.close().unwrap();
        set.close().unwrap();
    }

    let set = VolumeSet::open(&[&vol]).unwrap();
    let mut s = set.open_stream("data").unwrap();
    assert_eq!(s.size(), 13);
    assert_eq!(s.read_to_vec(13).unwrap(), b"Hello, World!");

    let props =
        Properties::from_text(&String::from_utf8(set.read_member("data/properties").unwrap()).unwrap());
    assert_eq!(props.get("type"), Some("Image"));
    assert_eq!(props.get("size"), Some("13"));
    assert_eq!(props.get("count"), Some("4"));
    assert_eq!(props.get("chunk_size"), Some("4"));
}

#[test]
fn image_round_trip_across_chunk_size_extremes() {
    let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();
    let len = data.len() as u64;

    for chunk_size in [1, 1024, 32768, len, len + 1] {
        let dir = TempDir::new().unwrap();
        let vol = dir.path().join("c.zip");
        {
            let set = VolumeSet::new();
            set.create_new_volume(&vol).unwrap();
            let mut s = set
                .create_stream_for_writing("data", StreamType::Image, image_props(chunk_size))
                .unwrap();
            // Feed in awkward slices so the residual buffer is exercised.
            for piece in data.chunks(333) {
                s.write(piece).unwrap();
            }
            s.close().unwrap();
            set.close().unwrap();
        }

        let set = VolumeSet::open(&[&vol]).unwrap();
        let mut s = set.open_stream("data").unwrap();
        assert_eq!(s.read_to_vec(data.len()).unwrap(), data, "chunk_size {chunk_size}");

        let props = Properties::from_text(
            &String::from_utf8(set.read_member("data/properties").unwrap()).unwrap(),
        );
        let expected_count = (len + chunk_size - 1) / chunk_size;
        assert_eq!(props.get("count"), Some(expected_count.to_string().as_str()));
    }
}

#[test]
fn image_reads_are_seekable_and_short_past_end() {
    let dir = TempDir::new().unwrap();
    let vol = dir.path().join("a.zip");
    {
        let set = VolumeSet::new();
        set.create_new_volume(&vol).unwrap();
        let mut s = set
            .create_stream_for_writing("data", StreamType::Image, image_props(4))
            .unwrap();
        s.write(b"Hello, World!").unwrap();
        s.close().unwrap();
        set.close().unwrap();
    }

    let set = VolumeSet::open(&[&vol]).unwrap();
    let mut s = set.open_stream("data").unwrap();
    s.seek_to(7).unwrap();
    assert_eq!(s.read_to_vec(100).unwrap(), b"World!");
    assert_eq!(s.read_to_vec(100).unwrap(), b"");
}

// ── Scenario 2 and 3: map streams ────────────────────────────────────────────

fn write_image(set: &VolumeSet, name: &str, content: &[u8]) {
    let mut s = set
        .create_stream_for_writing(name, StreamType::Image, image_props(32768))
        .unwrap();
    s.write(content).unwrap();
    s.close().unwrap();
}

#[test]
fn map_stream_splices_two_targets() {
    let dir = TempDir::new().unwrap();
    let vol = dir.path().join("m.zip");
    {
        let set = VolumeSet::new();
        set.create_new_volume(&vol).unwrap();
        write_image(&set, "s0", b"AAAAAAAA");
        write_image(&set, "s1", b"BBBBBBBB");

        let mut props = Properties::new();
        props.append("target", "s0");
        props.append("target", "s1");
        let mut map = set
            .create_stream_for_writing("logical", StreamType::Map, props)
            .unwrap();
        {
            let m = map.as_map_mut().unwrap();
            m.add_point(0, 0, 0);
            m.add_point(4, 0, 1);
            m.set_size(8);
        }
        map.close().unwrap();
        set.close().unwrap();
    }

    let set = VolumeSet::open(&[&vol]).unwrap();
    let mut s = set.open_stream("logical").unwrap();
    assert_eq!(s.read_to_vec(8).unwrap(), b"AAAABBBB");
}

#[test]
fn periodic_map_reassembles_interleaved_targets() {
    let dir = TempDir::new().unwrap();
    let vol = dir.path().join("raid.zip");
    {
        let set = VolumeSet::new();
        set.create_new_volume(&vol).unwrap();
        // Each target repeats its 6-byte unit once per period.
        write_image(&set, "s0", b"012345012345");
        write_image(&set, "s1", b"abcdefabcdef");

        let mut props = Properties::new();
        props.append("target", "s0");
        props.append("target", "s1");
        props.set("file_period", "6");
        props.set("image_period", "6");
        let mut map = set
            .create_stream_for_writing("raid", StreamType::Map, props)
            .unwrap();
        {
            let m = map.as_map_mut().unwrap();
            m.add_point(0, 0, 0);
            m.add_point(3, 0, 1);
            m.set_size(12);
        }
        map.close().unwrap();
        set.close().unwrap();
    }

    let set = VolumeSet::open(&[&vol]).unwrap();
    let mut s = set.open_stream("raid").unwrap();
    assert_eq!(s.read_to_vec(12).unwrap(), b"012abc012abc");
}

// ── Scenario 4 + P2: CD override ─────────────────────────────────────────────

#[test]
fn later_timestamp_wins_regardless_of_load_order() {
    let dir = TempDir::new().unwrap();
    let v1 = dir.path().join("v1.zip");
    let v2 = dir.path().join("v2.zip");
    let uuid = "11111111-2222-3333-4444-555555555555";

    let t1 = dos_datetime(2009, 1, 1, 0, 0, 0);
    let t2 = dos_datetime(2009, 1, 1, 0, 0, 2);
    build_volume(&v1, uuid, &[("foo", b"old contents", t1)]);
    build_volume(&v2, uuid, &[("foo", b"new contents", t2)]);

    for paths in [[&v1, &v2], [&v2, &v1]] {
        let set = VolumeSet::open(&paths).unwrap();
        assert_eq!(set.read_member("foo").unwrap(), b"new contents");
    }
}

// ── P3: tombstones ───────────────────────────────────────────────────────────

#[test]
fn tombstone_entry_hides_member() {
    let dir = TempDir::new().unwrap();
    let v = dir.path().join("t.zip");
    let uuid = "11111111-2222-3333-4444-555555555555";

    let t1 = dos_datetime(2009, 1, 1, 0, 0, 0);
    let t2 = dos_datetime(2009, 1, 1, 0, 0, 2);
    build_volume(&v, uuid, &[("gone", b"buried bytes", t1), ("gone", b"", t2)]);

    let set = VolumeSet::open(&[&v]).unwrap();
    assert!(matches!(set.read_member("gone"), Err(Error::NotFound(_))));
    assert!(!set.member_names().contains(&"gone".to_string()));
}

#[test]
fn delete_member_writes_a_tombstone() {
    let dir = TempDir::new().unwrap();
    let v = dir.path().join("d.zip");
    {
        let set = VolumeSet::new();
        set.create_new_volume(&v).unwrap();
        set.writestr("doomed", b"payload", CompressionMethod::Stored).unwrap();
        assert!(set.contains_member("doomed"));
        set.delete_member("doomed").unwrap();
        assert!(!set.contains_member("doomed"));
        set.close().unwrap();
    }

    let set = VolumeSet::open(&[&v]).unwrap();
    assert!(matches!(set.read_member("doomed"), Err(Error::NotFound(_))));
}

// ── P4: UUID enforcement ─────────────────────────────────────────────────────

#[test]
fn mismatched_uuids_refuse_to_merge() {
    let dir = TempDir::new().unwrap();
    let v1 = dir.path().join("v1.zip");
    let v2 = dir.path().join("v2.zip");
    let t = dos_datetime(2009, 1, 1, 0, 0, 0);
    build_volume(&v1, "11111111-1111-1111-1111-111111111111", &[("a", b"x", t)]);
    build_volume(&v2, "22222222-2222-2222-2222-222222222222", &[("b", b"y", t)]);

    assert!(matches!(VolumeSet::open(&[&v1, &v2]), Err(Error::Integrity(_))));
}

// ── Scenario 5 + P7: encrypted streams ───────────────────────────────────────

#[test]
fn encrypted_stream_round_trips_with_distinct_chunk_ciphertexts() {
    let dir = TempDir::new().unwrap();
    let vol = dir.path().join("e.zip");
    let payload = vec![0xAAu8; 40];

    {
        let set = VolumeSet::new();
        set.create_new_volume(&vol).unwrap();
        let mut props = image_props(16);
        props.set("scheme", "aes-sha-psk");
        props.set("salt", BASE64.encode([0u8, 1, 2, 3, 4, 5, 6, 7]));
        props.set("PSK", "Hello");
        let mut s = set
            .create_stream_for_writing("secret", StreamType::Encrypted, props)
            .unwrap();
        s.write(&payload).unwrap();
        s.close().unwrap();
        set.close().unwrap();
    }

    let set = VolumeSet::open(&[&vol]).unwrap();

    // Three stored ciphertext chunks, each 16 bytes, pairwise distinct even
    // though chunks 0 and 1 hold identical plaintext (the IV is per-chunk).
    let c0 = set.read_member("secret/00000000.dd").unwrap();
    let c1 = set.read_member("secret/00000001.dd").unwrap();
    let c2 = set.read_member("secret/00000002.dd").unwrap();
    assert_eq!((c0.len(), c1.len(), c2.len()), (16, 16, 16));
    assert_ne!(hex::encode(&c0), hex::encode(&c1));
    assert_ne!(hex::encode(&c1), hex::encode(&c2));
    assert_ne!(&c0[..], &payload[..16]);

    // Key material never reaches the persisted properties.
    let props = Properties::from_text(
        &String::from_utf8(set.read_member("secret/properties").unwrap()).unwrap(),
    );
    assert_eq!(props.get("PSK"), None);
    assert_eq!(props.get("scheme"), Some("aes-sha-psk"));
    assert_eq!(props.get("count"), Some("3"));

    set.set_key_provider(Rc::new(StaticKeyProvider("Hello".into())));
    let mut s = set.open_stream("secret").unwrap();
    assert_eq!(s.size(), 40);
    assert_eq!(s.read_to_vec(40).unwrap(), payload);
}

#[test]
fn encrypted_stream_without_key_material_fails() {
    let dir = TempDir::new().unwrap();
    let vol = dir.path().join("e.zip");
    {
        let set = VolumeSet::new();
        set.create_new_volume(&vol).unwrap();
        let mut props = image_props(16);
        props.set("scheme", "aes-sha-psk");
        props.set("PSK", "Hello");
        let mut s = set
            .create_stream_for_writing("secret", StreamType::Encrypted, props)
            .unwrap();
        s.write(&[0u8; 16]).unwrap();
        s.close().unwrap();
        set.close().unwrap();
    }

    let set = VolumeSet::open(&[&vol]).unwrap();
    // No environment PSK, no property, no provider.
    assert!(matches!(set.open_stream("secret"), Err(Error::MissingKey(_))));
}

// ── Scenario 6: overlay over an external file ────────────────────────────────

#[test]
fn overlay_stream_reads_external_bytes_verbatim() {
    let dir = TempDir::new().unwrap();
    let evidence = dir.path().join("evidence.bin");
    let content: Vec<u8> = (0..100u8).collect();
    std::fs::write(&evidence, &content).unwrap();

    let vol = dir.path().join("o.zip");
    {
        let set = VolumeSet::new();
        set.create_new_volume(&vol).unwrap();
        let mut s = set
            .create_stream_for_writing("overlay", StreamType::Overlay, Properties::new())
            .unwrap();
        {
            let o = s.as_overlay_mut().unwrap();
            o.set_chunk(0, 0, 100, 0, evidence.to_str().unwrap());
            o.set_size(100);
        }
        s.close().unwrap();
        set.close().unwrap();
    }

    let set = VolumeSet::open(&[&vol]).unwrap();
    let mut s = set.open_stream("overlay").unwrap();
    assert_eq!(s.size(), 100);
    assert_eq!(s.read_to_vec(100).unwrap(), content);

    // The chunk table is the documented text form.
    let table = set.read_member("overlay/overlay.00").unwrap();
    assert_eq!(String::from_utf8(table).unwrap(), "0,0,100,0,0\n");
}

// ── P8: descriptor matches the CD ────────────────────────────────────────────

#[test]
fn data_descriptors_agree_with_central_directory() {
    let dir = TempDir::new().unwrap();
    let vol = dir.path().join("p8.zip");
    {
        let set = VolumeSet::new();
        set.create_new_volume(&vol).unwrap();
        set.writestr("stored", b"stored member payload", CompressionMethod::Stored).unwrap();
        set.writestr("packed", b"deflated deflated deflated deflated", CompressionMethod::Deflate)
            .unwrap();
        set.close().unwrap();
    }

    let mut f = File::open(&vol).unwrap();
    let cd = read_central_directory(&mut f).unwrap();
    assert!(cd.entries.len() >= 3); // two members plus properties

    for entry in &cd.entries {
        assert_ne!(entry.flags & FLAG_DATA_DESCRIPTOR, 0);
        let data_offset = resolve_data_offset(&mut f, entry.header_offset).unwrap();
        f.seek(SeekFrom::Start(data_offset + entry.compressed_size)).unwrap();
        let mut descriptor = [0u8; 12];
        f.read_exact(&mut descriptor).unwrap();
        let crc = u32::from_le_bytes(descriptor[0..4].try_into().unwrap());
        let comp = u32::from_le_bytes(descriptor[4..8].try_into().unwrap());
        let uncomp = u32::from_le_bytes(descriptor[8..12].try_into().unwrap());
        assert_eq!(crc, entry.crc32, "{}", entry.name);
        assert_eq!(comp as u64, entry.compressed_size, "{}", entry.name);
        assert_eq!(uncomp as u64, entry.uncompressed_size, "{}", entry.name);
    }
}

// ── P9: multi-volume writes leave standalone volumes ─────────────────────────

#[test]
fn volume_switch_mid_stream_leaves_standalone_volumes() {
    let dir = TempDir::new().unwrap();
    let v1 = dir.path().join("part1.zip");
    let v2 = dir.path().join("part2.zip");
    let data: Vec<u8> = (0..64u8).collect();

    {
        let set = VolumeSet::new();
        set.create_new_volume(&v1).unwrap();
        let mut s = set
            .create_stream_for_writing("data", StreamType::Image, image_props(8))
            .unwrap();
        s.write(&data[..32]).unwrap();
        // Switching volumes flushes the outstanding writer into part1, so
        // part1 is usable on its own.
        set.create_new_volume(&v2).unwrap();
        s.write(&data[32..]).unwrap();
        s.close().unwrap();
        set.close().unwrap();
    }

    // Each volume opens by itself; the cross-reference completes the set.
    let set = VolumeSet::open(&[&v1]).unwrap();
    let volumes = set.properties();
    assert!(volumes.get_array("volume").contains(&"file://part1.zip".to_string()));
    assert!(volumes.get_array("volume").contains(&"file://part2.zip".to_string()));
    let mut s = set.open_stream("data").unwrap();
    assert_eq!(s.read_to_vec(64).unwrap(), data);

    // part1 alone still carries a self-sufficient copy of the stream
    // properties from the flush at switch time.
    let mut f = File::open(&v1).unwrap();
    let cd = read_central_directory(&mut f).unwrap();
    assert!(cd.entries.iter().any(|e| e.name == "data/properties"));
}

// ── Locking and unsupported operations ───────────────────────────────────────

#[test]
fn second_writer_is_locked_out_until_close() {
    let dir = TempDir::new().unwrap();
    let vol = dir.path().join("l.zip");
    let set = VolumeSet::new();
    set.create_new_volume(&vol).unwrap();

    let mut first = set.create_member("one", CompressionMethod::Stored).unwrap();
    first.write(b"held").unwrap();
    match set.create_member("two", CompressionMethod::Stored).map(|_| ()) {
        Err(Error::Locked(holder)) => assert_eq!(holder, "one"),
        other => panic!("expected Locked, got {other:?}"),
    }
    first.close().unwrap();
    let mut second = set.create_member("two", CompressionMethod::Stored).unwrap();
    second.write(b"fine").unwrap();
    second.close().unwrap();
    set.close().unwrap();
}

#[test]
fn deflate_members_refuse_random_access() {
    let dir = TempDir::new().unwrap();
    let vol = dir.path().join("u.zip");
    let set = VolumeSet::new();
    set.create_new_volume(&vol).unwrap();
    set.writestr("packed", b"deflate me, repeatedly, repeatedly", CompressionMethod::Deflate)
        .unwrap();
    set.writestr("flat", b"stored bytes", CompressionMethod::Stored).unwrap();

    assert!(matches!(set.open_member("packed"), Err(Error::Unsupported(_))));

    let mut m = set.open_member("flat").unwrap();
    m.seek(SeekFrom::Start(7)).unwrap();
    let mut buf = [0u8; 16];
    let n = m.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"bytes");
    set.close().unwrap();
}

#[test]
fn writable_members_refuse_seek() {
    let dir = TempDir::new().unwrap();
    let vol = dir.path().join("w.zip");
    let set = VolumeSet::new();
    set.create_new_volume(&vol).unwrap();
    let mut m = set.create_member("x", CompressionMethod::Deflate).unwrap();
    m.write(b"data").unwrap();
    assert!(matches!(m.seek(SeekFrom::Start(0)), Err(Error::Unsupported(_))));
    m.close().unwrap();
    set.close().unwrap();
}

// ── Appending to an existing volume ──────────────────────────────────────────

#[test]
fn append_volume_rewrites_the_directory_in_place() {
    let dir = TempDir::new().unwrap();
    let vol = dir.path().join("grow.zip");
    {
        let set = VolumeSet::new();
        set.create_new_volume(&vol).unwrap();
        set.writestr("first", b"generation one", CompressionMethod::Stored).unwrap();
        set.close().unwrap();
    }

    {
        let set = VolumeSet::open(&[&vol]).unwrap();
        set.append_volume(&vol).unwrap();
        set.writestr("second", b"generation two", CompressionMethod::Stored).unwrap();
        set.close().unwrap();
    }

    let set = VolumeSet::open(&[&vol]).unwrap();
    assert_eq!(set.read_member("first").unwrap(), b"generation one");
    assert_eq!(set.read_member("second").unwrap(), b"generation two");
}
