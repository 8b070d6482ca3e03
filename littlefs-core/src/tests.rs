use crate::{
    BadBlock, Config, FileConfig, FileType, LfsError, LittleFs, OpenFlags, RamBlockDevice,
    SeekFrom, UserAttr,
};

const BLOCK_SIZE: u32 = 512;
const BLOCK_COUNT: u32 = 128;

type Fs = LittleFs<RamBlockDevice>;

fn config() -> Config {
    Config::new(BLOCK_SIZE, BLOCK_COUNT)
}

fn formatted_device() -> RamBlockDevice {
    LittleFs::format(RamBlockDevice::new(BLOCK_SIZE, BLOCK_COUNT), &config()).unwrap()
}

fn mounted() -> Fs {
    LittleFs::mount(formatted_device(), &config()).unwrap()
}

fn remount(fs: Fs) -> Fs {
    LittleFs::mount(fs.unmount(), &config()).unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

fn write_file(fs: &mut Fs, path: &str, data: &[u8]) {
    let flags = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::TRUNC;
    let file = fs.file_open(path, flags).unwrap();
    assert_eq!(fs.file_write(&file, data).unwrap(), data.len());
    fs.file_close(file).unwrap();
}

fn read_file(fs: &mut Fs, path: &str) -> Vec<u8> {
    let file = fs.file_open(path, OpenFlags::RDONLY).unwrap();
    let mut data = Vec::new();
    // odd chunk size so reads straddle cache and block boundaries
    let mut buf = [0u8; 97];
    loop {
        let n = fs.file_read(&file, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    fs.file_close(file).unwrap();
    data
}

fn list(fs: &mut Fs, path: &str) -> Vec<String> {
    let dir = fs.dir_open(path).unwrap();
    let mut names = Vec::new();
    while let Some(info) = fs.dir_read(&dir).unwrap() {
        names.push(info.name);
    }
    fs.dir_close(dir).unwrap();
    names
}

fn sorted(mut names: Vec<String>) -> Vec<String> {
    names.sort();
    names
}

mod mount {
    use super::*;

    #[test]
    fn test_format_then_mount_is_empty() {
        let mut fs = mounted();
        assert_eq!(list(&mut fs, "/"), [".", ".."]);

        let root = fs.stat("/").unwrap();
        assert_eq!(root.kind, FileType::Dir);
        assert_eq!(root.name, "/");
        // the superblock entry is not a directory entry
        assert_eq!(fs.stat("/littlefs").err(), Some(LfsError::NoEnt));
        assert_eq!(fs.fs_size().unwrap(), 2);
    }

    #[test]
    fn test_mount_blank_device_fails() {
        let dev = RamBlockDevice::new(BLOCK_SIZE, BLOCK_COUNT);
        assert!(LittleFs::mount(dev, &config()).is_err());
    }

    #[test]
    fn test_mount_rejects_other_geometry() {
        let dev = formatted_device();
        let res = LittleFs::mount(dev, &Config::new(BLOCK_SIZE, BLOCK_COUNT / 2));
        assert_eq!(res.err(), Some(LfsError::Inval));
    }

    #[test]
    fn test_format_rejects_bad_config() {
        let dev = RamBlockDevice::new(BLOCK_SIZE, BLOCK_COUNT);
        let cfg = config().with_lookahead_size(7);
        assert_eq!(LittleFs::format(dev, &cfg).err(), Some(LfsError::Inval));
    }

    #[test]
    fn test_format_blank_device_for_each_block_cycles() {
        // 0xffffffff, the revision of an erased block, is a multiple of 3, 5,
        // 17 and 257
        for (block_size, block_count) in [(512, 128), (4096, 16), (256, 256)] {
            for cycles in [2, 4, 16, 256] {
                let cfg = Config::new(block_size, block_count).with_block_cycles(cycles);
                let dev = RamBlockDevice::new(block_size, block_count);
                let dev = LittleFs::format(dev, &cfg).unwrap();

                let mut fs = LittleFs::mount(dev, &cfg).unwrap();
                fs.mkdir("/d").unwrap();
                write_file(&mut fs, "/d/f", b"fresh");

                let mut fs = LittleFs::mount(fs.unmount(), &cfg).unwrap();
                assert_eq!(read_file(&mut fs, "/d/f"), b"fresh");
                assert_eq!(sorted(list(&mut fs, "/")), [".", "..", "d"]);
            }
        }
    }

    #[test]
    fn test_format_zeroed_device() {
        let cfg = config();
        let dev = RamBlockDevice::with_erase_value(BLOCK_SIZE, BLOCK_COUNT, 0);
        let dev = LittleFs::format(dev, &cfg).unwrap();
        let mut fs = LittleFs::mount(dev, &cfg).unwrap();
        assert_eq!(list(&mut fs, "/"), [".", ".."]);
    }

    #[test]
    fn test_timestamped_file_survives_remount() {
        let cfg = Config::new(4096, 16);
        let dev = LittleFs::format(RamBlockDevice::new(4096, 16), &cfg).unwrap();
        let mut fs = LittleFs::mount(dev, &cfg).unwrap();

        assert_eq!(fs.mkdir("/"), Err(LfsError::Exist));

        let flags = OpenFlags::WRONLY | OpenFlags::CREAT;
        let file = fs.file_open("/a.txt", flags).unwrap();
        assert_eq!(fs.file_write(&file, &[0x41; 10_000]).unwrap(), 10_000);
        let stamp = 1_700_000_000u32.to_le_bytes();
        fs.setattr("/a.txt", b't', &stamp).unwrap();
        fs.file_close(file).unwrap();

        let dev = fs.unmount();
        let mut fs = LittleFs::mount(dev, &cfg).unwrap();

        let file = fs.file_open("/a.txt", OpenFlags::RDONLY).unwrap();
        let mut buf = vec![0u8; 12_000];
        let mut total = 0;
        loop {
            let n = fs.file_read(&file, &mut buf[total..]).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 10_000);
        assert!(buf[..total].iter().all(|&b| b == 0x41));
        fs.file_close(file).unwrap();

        let mut attr = [0u8; 4];
        assert_eq!(fs.getattr("/a.txt", b't', &mut attr), Ok(4));
        assert_eq!(attr, stamp);
    }
}

mod files {
    use super::*;

    #[test]
    fn test_sizes_around_inline_and_block_edges() {
        let mut fs = mounted();
        let inline_max = 64;
        let sizes = [
            0,
            1,
            inline_max - 1,
            inline_max,
            inline_max + 1,
            BLOCK_SIZE as usize - 1,
            BLOCK_SIZE as usize,
            BLOCK_SIZE as usize + 1,
            4 * BLOCK_SIZE as usize + 123,
        ];
        for &size in &sizes {
            write_file(&mut fs, &format!("/f{}", size), &pattern(size));
        }

        let mut fs = remount(fs);
        for &size in &sizes {
            let path = format!("/f{}", size);
            assert_eq!(fs.stat(&path).unwrap().size, size as u32);
            assert_eq!(read_file(&mut fs, &path), pattern(size), "size {}", size);
        }
    }

    #[test]
    fn test_random_access_matches_written_order() {
        let mut fs = mounted();
        let data = pattern(3000);
        write_file(&mut fs, "/seek", &data);

        let file = fs.file_open("/seek", OpenFlags::RDONLY).unwrap();
        for i in 0..100usize {
            let pos = (i * 997) % data.len();
            assert_eq!(fs.file_seek(&file, SeekFrom::Start(pos as u32)), Ok(pos as u32));
            let mut byte = [0u8; 1];
            assert_eq!(fs.file_read(&file, &mut byte), Ok(1));
            assert_eq!(byte[0], data[pos], "pos {}", pos);
            assert_eq!(fs.file_tell(&file), Ok(pos as u32 + 1));
        }
        assert_eq!(fs.file_seek(&file, SeekFrom::End(-1)), Ok(2999));
        assert_eq!(fs.file_seek(&file, SeekFrom::Current(-1000)), Ok(1999));
        fs.file_rewind(&file).unwrap();
        assert_eq!(fs.file_tell(&file), Ok(0));
        fs.file_close(file).unwrap();
    }

    #[test]
    fn test_append_and_overwrite() {
        let mut fs = mounted();
        write_file(&mut fs, "/log", b"hello");

        let file = fs
            .file_open("/log", OpenFlags::WRONLY | OpenFlags::APPEND)
            .unwrap();
        fs.file_write(&file, b" world").unwrap();
        fs.file_close(file).unwrap();
        assert_eq!(read_file(&mut fs, "/log"), b"hello world");

        let file = fs.file_open("/log", OpenFlags::RDWR).unwrap();
        fs.file_write(&file, b"J").unwrap();
        assert_eq!(fs.file_size(&file), Ok(11));
        fs.file_close(file).unwrap();
        assert_eq!(read_file(&mut fs, "/log"), b"Jello world");
    }

    #[test]
    fn test_write_past_end_zero_fills() {
        let mut fs = mounted();
        let file = fs
            .file_open("/sparse", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        fs.file_write(&file, b"ab").unwrap();
        assert_eq!(fs.file_seek(&file, SeekFrom::Start(10)), Ok(10));
        fs.file_write(&file, b"c").unwrap();
        assert_eq!(fs.file_size(&file), Ok(11));
        fs.file_close(file).unwrap();

        let mut expected = b"ab".to_vec();
        expected.extend_from_slice(&[0; 8]);
        expected.push(b'c');
        assert_eq!(read_file(&mut fs, "/sparse"), expected);
    }

    #[test]
    fn test_truncate_shrinks_and_grows() {
        let mut fs = mounted();
        let data = pattern(2000);
        write_file(&mut fs, "/t", &data);

        let file = fs.file_open("/t", OpenFlags::RDWR).unwrap();
        fs.file_truncate(&file, 700).unwrap();
        assert_eq!(fs.file_size(&file), Ok(700));
        fs.file_close(file).unwrap();
        assert_eq!(read_file(&mut fs, "/t"), &data[..700]);

        let file = fs.file_open("/t", OpenFlags::RDWR).unwrap();
        fs.file_truncate(&file, 1000).unwrap();
        fs.file_close(file).unwrap();

        let mut fs = remount(fs);
        let mut expected = data[..700].to_vec();
        expected.resize(1000, 0);
        assert_eq!(read_file(&mut fs, "/t"), expected);

        let file = fs.file_open("/t", OpenFlags::RDWR).unwrap();
        fs.file_truncate(&file, 0).unwrap();
        fs.file_close(file).unwrap();
        assert_eq!(fs.stat("/t").unwrap().size, 0);
    }

    #[test]
    fn test_open_errors() {
        let mut fs = mounted();
        write_file(&mut fs, "/x", b"x");
        fs.mkdir("/d").unwrap();

        assert_eq!(fs.file_open("/nope", OpenFlags::RDONLY).err(), Some(LfsError::NoEnt));
        let excl = OpenFlags::WRONLY | OpenFlags::CREAT | OpenFlags::EXCL;
        assert_eq!(fs.file_open("/x", excl).err(), Some(LfsError::Exist));
        assert_eq!(fs.file_open("/d", OpenFlags::RDONLY).err(), Some(LfsError::IsDir));
        let creat = OpenFlags::WRONLY | OpenFlags::CREAT;
        assert_eq!(fs.file_open("/d/a/b", creat).err(), Some(LfsError::NoEnt));
        assert_eq!(fs.file_open("/x/y", creat).err(), Some(LfsError::NotDir));
        let long = format!("/{}", "n".repeat(33));
        assert_eq!(fs.file_open(&long, creat).err(), Some(LfsError::NameTooLong));
    }

    #[test]
    fn test_access_mode_is_enforced() {
        let mut fs = mounted();
        write_file(&mut fs, "/x", b"data");

        let file = fs.file_open("/x", OpenFlags::RDONLY).unwrap();
        assert_eq!(fs.file_write(&file, b"no"), Err(LfsError::BadF));
        assert_eq!(fs.file_truncate(&file, 0), Err(LfsError::BadF));
        assert_eq!(fs.file_seek(&file, SeekFrom::Current(-1)), Err(LfsError::Inval));
        fs.file_close(file).unwrap();

        let file = fs.file_open("/x", OpenFlags::WRONLY).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.file_read(&file, &mut buf), Err(LfsError::BadF));
        fs.file_close(file).unwrap();
    }

    #[test]
    fn test_sync_makes_data_visible_to_new_handles() {
        let mut fs = mounted();
        let file = fs
            .file_open("/s", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        let data = pattern(1500);
        fs.file_write(&file, &data).unwrap();
        fs.file_sync(&file).unwrap();

        assert_eq!(read_file(&mut fs, "/s"), data);
        fs.file_close(file).unwrap();
    }

    #[test]
    fn test_repeated_rewrites_compact_metadata() {
        let mut fs = mounted();
        for i in 0..200 {
            write_file(&mut fs, "/counter", format!("{}", i).as_bytes());
        }

        let mut fs = remount(fs);
        assert_eq!(read_file(&mut fs, "/counter"), b"199");
        assert_eq!(list(&mut fs, "/"), [".", "..", "counter"]);
        assert!(fs.fs_size().unwrap() < BLOCK_COUNT / 2);
    }
}

mod dirs {
    use super::*;

    #[test]
    fn test_mkdir_and_list() {
        let mut fs = mounted();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/a/b").unwrap();
        write_file(&mut fs, "/a/f", b"in a");

        assert_eq!(fs.mkdir("/a"), Err(LfsError::Exist));
        assert_eq!(fs.mkdir("/missing/x"), Err(LfsError::NoEnt));
        assert_eq!(fs.dir_open("/a/f").err(), Some(LfsError::NotDir));

        let mut fs = remount(fs);
        assert_eq!(sorted(list(&mut fs, "/a")), [".", "..", "b", "f"]);
        assert_eq!(list(&mut fs, "/a/b"), [".", ".."]);

        let info = fs.stat("/a/f").unwrap();
        assert_eq!(info.kind, FileType::Reg);
        assert_eq!(info.size, 4);
        assert_eq!(fs.stat("/a/b/../f").unwrap().name, "f");
        assert_eq!(fs.stat("/a/./b").unwrap().kind, FileType::Dir);
    }

    #[test]
    fn test_many_entries_split_the_directory() {
        let mut fs = mounted();
        fs.mkdir("/many").unwrap();
        let names: Vec<String> = (0..60).map(|i| format!("file{:02}", i)).collect();
        for name in &names {
            write_file(&mut fs, &format!("/many/{}", name), name.as_bytes());
        }

        let mut fs = remount(fs);
        let listed = list(&mut fs, "/many");
        assert_eq!(listed.len(), names.len() + 2);
        let mut expected: Vec<String> = vec![".".into(), "..".into()];
        expected.extend(names.iter().cloned());
        assert_eq!(sorted(listed), sorted(expected));
        for name in &names {
            assert_eq!(read_file(&mut fs, &format!("/many/{}", name)), name.as_bytes());
        }
    }

    #[test]
    fn test_seek_returns_to_told_position() {
        let mut fs = mounted();
        for name in ["a", "b", "c", "d", "e"] {
            write_file(&mut fs, &format!("/{}", name), name.as_bytes());
        }

        let dir = fs.dir_open("/").unwrap();
        for _ in 0..3 {
            fs.dir_read(&dir).unwrap().unwrap();
        }
        let pos = fs.dir_tell(&dir).unwrap();
        assert_eq!(pos, 3);
        let next = fs.dir_read(&dir).unwrap().unwrap();

        while fs.dir_read(&dir).unwrap().is_some() {}
        assert_eq!(fs.dir_tell(&dir), Ok(7));

        fs.dir_seek(&dir, pos).unwrap();
        assert_eq!(fs.dir_read(&dir).unwrap(), Some(next));

        fs.dir_seek(&dir, 7).unwrap();
        assert_eq!(fs.dir_read(&dir), Ok(None));

        fs.dir_rewind(&dir).unwrap();
        assert_eq!(fs.dir_read(&dir).unwrap().unwrap().name, ".");
        fs.dir_close(dir).unwrap();
    }

    #[test]
    fn test_remove() {
        let mut fs = mounted();
        fs.mkdir("/d").unwrap();
        write_file(&mut fs, "/d/f", b"x");

        assert_eq!(fs.remove("/d"), Err(LfsError::NotEmpty));
        assert_eq!(fs.remove("/"), Err(LfsError::Inval));
        assert_eq!(fs.remove("/missing"), Err(LfsError::NoEnt));

        fs.remove("/d/f").unwrap();
        fs.remove("/d").unwrap();
        assert_eq!(fs.stat("/d").err(), Some(LfsError::NoEnt));

        let mut fs = remount(fs);
        assert_eq!(list(&mut fs, "/"), [".", ".."]);
        assert_eq!(fs.fs_size().unwrap(), 2);
    }

    #[test]
    fn test_rename() {
        let mut fs = mounted();
        write_file(&mut fs, "/a", b"a");
        fs.rename("/a", "/b").unwrap();
        assert_eq!(fs.stat("/a").err(), Some(LfsError::NoEnt));
        assert_eq!(read_file(&mut fs, "/b"), b"a");

        // across directories
        fs.mkdir("/d1").unwrap();
        fs.mkdir("/d2").unwrap();
        write_file(&mut fs, "/d1/f", &pattern(900));
        fs.rename("/d1/f", "/d2/g").unwrap();
        assert_eq!(list(&mut fs, "/d1"), [".", ".."]);
        assert_eq!(read_file(&mut fs, "/d2/g"), pattern(900));

        // replace a file
        write_file(&mut fs, "/p", b"1");
        write_file(&mut fs, "/q", b"2");
        fs.rename("/p", "/q").unwrap();
        assert_eq!(fs.stat("/p").err(), Some(LfsError::NoEnt));
        assert_eq!(read_file(&mut fs, "/q"), b"1");

        // onto itself
        fs.rename("/q", "/q").unwrap();
        assert_eq!(read_file(&mut fs, "/q"), b"1");

        assert_eq!(fs.rename("/q", "/d1"), Err(LfsError::IsDir));
        assert_eq!(fs.rename("/d1", "/d2"), Err(LfsError::NotEmpty));

        // replace an empty directory
        fs.rename("/d2", "/d1").unwrap();
        assert_eq!(fs.stat("/d2").err(), Some(LfsError::NoEnt));

        let mut fs = remount(fs);
        assert_eq!(list(&mut fs, "/d1"), [".", "..", "g"]);
        assert_eq!(sorted(list(&mut fs, "/")), [".", "..", "b", "d1", "q"]);
        assert_eq!(read_file(&mut fs, "/d1/g"), pattern(900));
    }
}

mod attrs {
    use super::*;

    #[test]
    fn test_path_attributes() {
        let mut fs = mounted();
        write_file(&mut fs, "/f", b"body");
        let mut buf = [0u8; 16];

        assert_eq!(fs.getattr("/", b'a', &mut buf), Err(LfsError::NoAttr));
        fs.setattr("/", b'a', b"root").unwrap();
        assert_eq!(fs.getattr("/", b'a', &mut buf), Ok(4));
        assert_eq!(&buf[..4], b"root");

        fs.setattr("/f", b'x', b"hello world").unwrap();
        let mut short = [0u8; 5];
        assert_eq!(fs.getattr("/f", b'x', &mut short), Ok(11));
        assert_eq!(&short, b"hello");

        fs.removeattr("/f", b'x').unwrap();
        assert_eq!(fs.getattr("/f", b'x', &mut buf), Err(LfsError::NoAttr));

        assert_eq!(fs.setattr("/f", b'y', &[0; 1023]), Err(LfsError::NoSpc));
        assert_eq!(fs.getattr("/nope", b'a', &mut buf), Err(LfsError::NoEnt));

        let mut fs = remount(fs);
        assert_eq!(fs.getattr("/", b'a', &mut buf), Ok(4));
        assert_eq!(read_file(&mut fs, "/f"), b"body");
    }

    #[test]
    fn test_file_config_attributes() {
        let mut fs = mounted();
        let cfg = FileConfig {
            attrs: vec![UserAttr::new(b'v', 4)],
        };
        let file = fs
            .file_opencfg("/cfg", OpenFlags::RDWR | OpenFlags::CREAT, cfg)
            .unwrap();
        fs.file_set_attr(&file, b'v', &[1, 2, 3, 4]).unwrap();
        fs.file_write(&file, b"data").unwrap();
        fs.file_close(file).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(fs.getattr("/cfg", b'v', &mut buf), Ok(4));
        assert_eq!(buf, [1, 2, 3, 4]);

        let mut fs = remount(fs);
        let cfg = FileConfig {
            attrs: vec![UserAttr::new(b'v', 4)],
        };
        let file = fs.file_opencfg("/cfg", OpenFlags::RDONLY, cfg).unwrap();
        assert_eq!(fs.file_attr(&file, b'v'), Ok(&[1u8, 2, 3, 4][..]));
        assert_eq!(fs.file_attr(&file, b'w'), Err(LfsError::NoAttr));
        assert_eq!(fs.file_set_attr(&file, b'v', &[0]), Err(LfsError::BadF));
        fs.file_close(file).unwrap();
    }
}

mod blocks {
    use super::*;
    use crate::fs_core::mdir::MDir;
    use crate::layout::pair::ROOT_PAIR;

    #[test]
    fn test_traverse_covers_blocks_in_use() {
        let mut fs = mounted();
        fs.mkdir("/sub").unwrap();
        for i in 0..3 {
            write_file(&mut fs, &format!("/sub/f{}", i), &pattern(2000));
        }

        let mut blocks = Vec::new();
        fs.fs_traverse(|block| {
            blocks.push(block);
            Ok(())
        })
        .unwrap();
        let total = blocks.len();
        blocks.sort_unstable();
        blocks.dedup();
        // the subdirectory pair is seen through its entry and the tail list
        assert_eq!(total, blocks.len() + 2);
        assert_eq!(fs.fs_size().unwrap() as usize, blocks.len());

        let before = fs.fs_size().unwrap();
        fs.remove("/sub/f1").unwrap();
        assert!(fs.fs_size().unwrap() < before);
    }

    #[test]
    fn test_compaction_is_idempotent() {
        let cfg = config().with_block_cycles(-1);
        let dev = RamBlockDevice::new(BLOCK_SIZE, BLOCK_COUNT);
        let dev = LittleFs::format(dev, &cfg).unwrap();
        let mut fs = LittleFs::mount(dev, &cfg).unwrap();
        fs.mkdir("/d").unwrap();
        write_file(&mut fs, "/f", &pattern(40));
        write_file(&mut fs, "/f", &pattern(20));
        fs.setattr("/f", b'x', b"attr").unwrap();

        let mut logs = Vec::new();
        for _ in 0..2 {
            let mut dir = MDir::default();
            fs.dir_fetch(&mut dir, ROOT_PAIR).unwrap();
            dir.erased = false;
            fs.dir_commit(&mut dir, &[]).unwrap();
            let log = fs.device_mut().block(dir.pair[0])[..dir.off as usize].to_vec();
            logs.push((dir.rev, log));
        }

        let (rev0, first) = &logs[0];
        let (rev1, second) = &logs[1];
        assert_eq!(*rev1, rev0.wrapping_add(1));
        assert_eq!(first.len(), second.len());
        // past the revision only the crc over it may change
        let diff: Vec<usize> = (4..first.len()).filter(|&i| first[i] != second[i]).collect();
        assert!(diff.len() <= 4, "{:?}", diff);
        if let (Some(&lo), Some(&hi)) = (diff.first(), diff.last()) {
            assert!(hi - lo < 4, "{:?}", diff);
        }

        let mut fs = LittleFs::mount(fs.unmount(), &cfg).unwrap();
        assert_eq!(read_file(&mut fs, "/f"), pattern(20));
        assert_eq!(sorted(list(&mut fs, "/")), [".", "..", "d", "f"]);
    }

    #[test]
    fn test_no_space_left() {
        let mut fs = mounted();
        let file = fs
            .file_open("/huge", OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        let chunk = pattern(BLOCK_SIZE as usize);
        let mut res = Ok(0);
        for _ in 0..BLOCK_COUNT {
            res = fs.file_write(&file, &chunk);
            if res.is_err() {
                break;
            }
        }
        assert_eq!(res, Err(LfsError::NoSpc));
        let _ = fs.file_close(file);

        // still usable once the handle is gone
        let mut fs = remount(fs);
        write_file(&mut fs, "/small", b"ok");
        assert_eq!(read_file(&mut fs, "/small"), b"ok");
    }

    #[test]
    fn test_bad_blocks_are_relocated_around() {
        let mut fs = mounted();
        for block in 2..64 {
            fs.device_mut().set_bad_block(block, BadBlock::ProgError);
        }

        let data = pattern(6000);
        write_file(&mut fs, "/big", &data);

        // only the root pair and the file's data blocks are in use
        let mut used = Vec::new();
        fs.fs_traverse(|block| {
            used.push(block);
            Ok(())
        })
        .unwrap();
        assert!(used.iter().all(|&b| !(2..64).contains(&b)), "{:?}", used);

        fs.mkdir("/sub").unwrap();
        write_file(&mut fs, "/sub/f", &pattern(700));

        let mut fs = remount(fs);
        assert_eq!(read_file(&mut fs, "/big"), data);
        assert_eq!(read_file(&mut fs, "/sub/f"), pattern(700));
    }
}

mod power_loss {
    use super::*;

    /// Run `op` on a copy of `base` with every possible power budget until it
    /// completes, handing each recovered filesystem to `check` along with
    /// whether `op` reported success.
    fn each_interruption(
        base: &RamBlockDevice,
        op: impl FnMut(&mut Fs) -> crate::Result<()>,
        check: impl FnMut(&mut Fs, bool),
    ) {
        each_interruption_with(&config(), base, op, check);
    }

    fn each_interruption_with(
        cfg: &Config,
        base: &RamBlockDevice,
        mut op: impl FnMut(&mut Fs) -> crate::Result<()>,
        mut check: impl FnMut(&mut Fs, bool),
    ) {
        for budget in 0..1000 {
            let mut fs = LittleFs::mount(base.clone(), cfg).unwrap();
            fs.device_mut().set_power_budget(budget);
            let res = op(&mut fs);

            let mut dev = fs.unmount();
            dev.clear_power_budget();
            let mut fs = LittleFs::mount(dev, cfg).unwrap();
            fs.fs_mkconsistent().unwrap();
            check(&mut fs, res.is_ok());

            if res.is_ok() {
                return;
            }
        }
        panic!("operation never completed");
    }

    #[test]
    fn test_mkdir_is_atomic() {
        let mut fs = mounted();
        write_file(&mut fs, "/keep", &pattern(300));
        let base = fs.unmount();

        each_interruption(
            &base,
            |fs| fs.mkdir("/d"),
            |fs, ok| {
                match fs.stat("/d") {
                    Ok(info) => assert_eq!(info.kind, FileType::Dir),
                    Err(err) => {
                        assert_eq!(err, LfsError::NoEnt);
                        assert!(!ok);
                        fs.mkdir("/d").unwrap();
                    }
                }
                assert_eq!(sorted(list(fs, "/")), [".", "..", "d", "keep"]);
                assert_eq!(read_file(fs, "/keep"), pattern(300));
                write_file(fs, "/d/f", b"usable");
                assert_eq!(read_file(fs, "/d/f"), b"usable");
            },
        );
    }

    #[test]
    fn test_rename_across_directories_is_atomic() {
        let mut fs = mounted();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        write_file(&mut fs, "/a/f", &pattern(300));
        let base = fs.unmount();

        each_interruption(
            &base,
            |fs| fs.rename("/a/f", "/b/g"),
            |fs, ok| {
                let old = fs.stat("/a/f").is_ok();
                let new = fs.stat("/b/g").is_ok();
                assert_ne!(old, new, "exactly one name must survive");
                if ok {
                    assert!(new);
                }
                let path = if new { "/b/g" } else { "/a/f" };
                assert_eq!(read_file(fs, path), pattern(300));
            },
        );
    }

    #[test]
    fn test_remove_directory_leaves_no_orphan() {
        let mut fs = mounted();
        fs.mkdir("/a").unwrap();
        write_file(&mut fs, "/keep", b"keep");
        let size = fs.fs_size().unwrap();
        let base = fs.unmount();

        each_interruption(
            &base,
            |fs| fs.remove("/a"),
            |fs, ok| match fs.stat("/a") {
                Ok(_) => {
                    assert!(!ok);
                    assert_eq!(fs.fs_size().unwrap(), size);
                }
                Err(err) => {
                    assert_eq!(err, LfsError::NoEnt);
                    // the directory's pair is gone from the metadata list
                    assert_eq!(fs.fs_size().unwrap(), size - 2);
                    assert_eq!(read_file(fs, "/keep"), b"keep");
                }
            },
        );
    }

    #[test]
    fn test_file_write_keeps_old_contents_until_sync() {
        let mut fs = mounted();
        write_file(&mut fs, "/f", &pattern(1000));
        let base = fs.unmount();

        each_interruption(
            &base,
            |fs| {
                let file = fs.file_open("/f", OpenFlags::RDWR)?;
                fs.file_write(&file, &[0xaa; 1500])?;
                fs.file_close(file)
            },
            |fs, _| {
                let data = read_file(fs, "/f");
                assert!(data == pattern(1000) || data == [0xaa; 1500], "torn write");
            },
        );
    }

    #[test]
    fn test_rewrites_survive_power_loss_while_relocating() {
        let cfg = config().with_block_cycles(2);
        let dev = RamBlockDevice::new(BLOCK_SIZE, BLOCK_COUNT);
        let dev = LittleFs::format(dev, &cfg).unwrap();
        let mut fs = LittleFs::mount(dev, &cfg).unwrap();
        fs.mkdir("/d").unwrap();
        write_file(&mut fs, "/keep", &pattern(300));
        write_file(&mut fs, "/d/a", &pattern(8));
        let base = fs.unmount();

        each_interruption_with(
            &cfg,
            &base,
            |fs| {
                // enough commits to evict the pair of /d several times
                for n in 9..40 {
                    let file = fs.file_open("/d/a", OpenFlags::WRONLY | OpenFlags::TRUNC)?;
                    fs.file_write(&file, &pattern(n))?;
                    fs.file_close(file)?;
                }
                Ok(())
            },
            |fs, ok| {
                let data = read_file(fs, "/d/a");
                assert!((8..40).any(|n| data == pattern(n)), "torn rewrite of {} bytes", data.len());
                if ok {
                    assert_eq!(data, pattern(39));
                }
                assert_eq!(read_file(fs, "/keep"), pattern(300));
                assert_eq!(list(fs, "/d"), [".", "..", "a"]);
                write_file(fs, "/d/b", b"usable");
                assert_eq!(read_file(fs, "/d/b"), b"usable");
            },
        );
    }
}

mod wear {
    use super::*;

    #[test]
    fn test_metadata_wear_moves_across_blocks() {
        for cycles in 2..=4 {
            let cfg = config().with_block_cycles(cycles);
            let dev = RamBlockDevice::new(BLOCK_SIZE, BLOCK_COUNT);
            let dev = LittleFs::format(dev, &cfg).unwrap();
            let mut fs = LittleFs::mount(dev, &cfg).unwrap();
            fs.mkdir("/d").unwrap();

            for i in 0..300 {
                write_file(&mut fs, "/d/a", &pattern(i % 40 + 1));
                if i % 10 == 9 {
                    // bounce through the root so the superblock pair churns too
                    fs.rename("/d/a", "/a").unwrap();
                    fs.rename("/a", "/d/a").unwrap();
                }
            }

            let dev = fs.unmount();
            let wear: Vec<u32> = (0..BLOCK_COUNT).map(|b| dev.erase_count(b)).collect();
            let total: u32 = wear.iter().sum();
            let max = wear.iter().copied().max().unwrap_or(0);
            // without eviction only the root pair and the pair of /d wear
            let worn = wear[2..].iter().filter(|&&n| n > 0).count();
            assert!(worn >= 6, "cycles {}: {:?}", cycles, wear);
            assert!(max * 2 < total, "cycles {}: {:?}", cycles, wear);

            let mut fs = LittleFs::mount(dev, &cfg).unwrap();
            assert_eq!(read_file(&mut fs, "/d/a"), pattern(299 % 40 + 1));
            assert_eq!(sorted(list(&mut fs, "/")), [".", "..", "d"]);
            assert_eq!(list(&mut fs, "/d"), [".", "..", "a"]);
            assert_eq!(fs.stat("/a").err(), Some(LfsError::NoEnt));
        }
    }

    #[test]
    fn test_rename_churn_under_small_block_cycles() {
        let cfg = config().with_block_cycles(2);
        let dev = RamBlockDevice::new(BLOCK_SIZE, BLOCK_COUNT);
        let dev = LittleFs::format(dev, &cfg).unwrap();
        let mut fs = LittleFs::mount(dev, &cfg).unwrap();
        fs.mkdir("/a").unwrap();
        fs.mkdir("/b").unwrap();
        write_file(&mut fs, "/a/big", &pattern(3000));

        for i in 0..60 {
            let (from, to) = if i % 2 == 0 { ("/a/big", "/b/big") } else { ("/b/big", "/a/big") };
            fs.rename(from, to).unwrap();
            fs.mkdir(&format!("/a/s{}", i)).unwrap();
            if i >= 4 {
                fs.remove(&format!("/a/s{}", i - 4)).unwrap();
            }
        }

        let mut fs = LittleFs::mount(fs.unmount(), &cfg).unwrap();
        assert_eq!(read_file(&mut fs, "/a/big"), pattern(3000));
        assert_eq!(
            sorted(list(&mut fs, "/a")),
            [".", "..", "big", "s56", "s57", "s58", "s59"]
        );
        assert_eq!(list(&mut fs, "/b"), [".", ".."]);
        fs.fs_mkconsistent().unwrap();
    }
}
