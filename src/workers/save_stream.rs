//! Disk persistence of dispatched frame sets
//!
//! Layout of one started period of a session:
//!
//! ```text
//! <root>/<session>/<run>/000/00000000.jpg
//! <root>/<session>/<run>/001/00000000.jpg
//! <root>/<session>/<run>/pose_000.txt
//! <root>/<session>/<run>/pose_001.txt
//! <root>/<session>/<run>/timestamps.txt
//! ```
//!
//! The frame index is shared by every camera of a frame set and only moves
//! forward once all its images were written. Failures are logged and the
//! frame set is skipped.

use image::{DynamicImage, ImageFormat};
use log::{debug, error, info};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::assets::{MAX_CAMERAS, TIMESTAMP_LOG_NAME};
use crate::pipeline::types::{Pose, SharedImage, Timestamp, pose_to_rows};
use crate::workers::sink::SinkHandler;

/// Frame set handed to the persistence sink
#[derive(Debug, Clone)]
pub struct SaveItem {
    pub session: String,
    pub run: u64,
    pub timestamp: Timestamp,
    pub images: Vec<SharedImage>,
    pub poses: Vec<Pose>,
}

#[derive(Debug)]
pub enum SaveCommand {
    Frame(SaveItem),
    /// Close the files of a session once it stopped
    Close { session: String },
}

/// Open files of one started period
struct SaveRun {
    run: u64,
    dir: PathBuf,
    pose_logs: Vec<Option<BufWriter<File>>>,
    timestamps: BufWriter<File>,
    index: u64,
}

impl SaveRun {
    fn open(dir: PathBuf, run: u64) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let timestamps = BufWriter::new(File::create(dir.join(TIMESTAMP_LOG_NAME))?);

        Ok(Self {
            run,
            dir,
            pose_logs: (0..MAX_CAMERAS).map(|_| None).collect(),
            timestamps,
            index: 0,
        })
    }

    fn camera_dir(&self, camera: usize) -> PathBuf {
        self.dir.join(format!("{:03}", camera))
    }

    fn pose_log(&mut self, camera: usize) -> io::Result<&mut BufWriter<File>> {
        let path = self.dir.join(format!("pose_{:03}.txt", camera));
        let slot = self
            .pose_logs
            .get_mut(camera)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "camera index out of range"))?;

        if slot.is_none() {
            *slot = Some(BufWriter::new(File::create(path)?));
        }
        slot.as_mut()
            .ok_or_else(|| io::Error::other("pose log unavailable"))
    }

    fn write(&mut self, item: &SaveItem) -> io::Result<()> {
        for (camera, image) in item.images.iter().enumerate() {
            let dir = self.camera_dir(camera);
            fs::create_dir_all(&dir)?;
            save_image(&dir, self.index, image)?;
        }

        for (camera, pose) in item.poses.iter().enumerate().take(item.images.len()) {
            let row = pose_row(pose);
            let log = self.pose_log(camera)?;
            writeln!(log, "{}", row)?;
            log.flush()?;
        }

        writeln!(self.timestamps, "{}", item.timestamp.millis)?;
        self.timestamps.flush()?;

        self.index += 1;
        Ok(())
    }
}

/// Write one image as `%08d.jpg`; 16-bit grey goes to PNG since JPEG cannot hold it
fn save_image(dir: &Path, index: u64, image: &DynamicImage) -> io::Result<()> {
    let (extension, format) = match image {
        DynamicImage::ImageLuma16(_) => ("png", ImageFormat::Png),
        _ => ("jpg", ImageFormat::Jpeg),
    };
    let path = dir.join(format!("{:08}.{}", index, extension));

    image
        .save_with_format(&path, format)
        .map_err(|e| io::Error::other(format!("{}: {}", path.display(), e)))
}

/// 16 space-separated values, row-major
fn pose_row(pose: &Pose) -> String {
    pose_to_rows(pose)
        .iter()
        .flatten()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

pub struct SaveStream {
    root: PathBuf,
    runs: HashMap<String, SaveRun>,
}

impl SaveStream {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            runs: HashMap::new(),
        }
    }

    fn save(&mut self, item: SaveItem) {
        let reopen = self
            .runs
            .get(&item.session)
            .is_none_or(|current| current.run != item.run);

        if reopen {
            let dir = self
                .root
                .join(&item.session)
                .join(format!("{:03}", item.run));
            match SaveRun::open(dir, item.run) {
                Ok(run) => {
                    info!("SaveStream: writing {} to {}", item.session, run.dir.display());
                    self.runs.insert(item.session.clone(), run);
                }
                Err(e) => {
                    error!("SaveStream: cannot open output for {}: {}", item.session, e);
                    return;
                }
            }
        }

        let Some(run) = self.runs.get_mut(&item.session) else {
            return;
        };
        match run.write(&item) {
            Ok(()) => debug!("SaveStream: {} frame {} saved", item.session, run.index - 1),
            Err(e) => error!("SaveStream: {} frame at {} not saved: {}", item.session, item.timestamp, e),
        }
    }
}

impl SinkHandler<SaveCommand> for SaveStream {
    fn handle(&mut self, item: SaveCommand) {
        match item {
            SaveCommand::Frame(item) => self.save(item),
            SaveCommand::Close { session } => {
                if let Some(run) = self.runs.remove(&session) {
                    info!("SaveStream: closed {} after {} frames", session, run.index);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, ImageBuffer, Luma};
    use std::sync::Arc;

    fn grey(value: u8) -> SharedImage {
        Arc::new(DynamicImage::ImageLuma8(GrayImage::from_pixel(4, 4, Luma([value]))))
    }

    fn item(run: u64, millis: i64, cameras: usize) -> SaveCommand {
        let mut pose = Pose::identity();
        pose[(0, 3)] = 1.5;
        SaveCommand::Frame(SaveItem {
            session: "s1".into(),
            run,
            timestamp: Timestamp::from_millis(millis),
            images: (0..cameras).map(|i| grey(i as u8 * 100)).collect(),
            poses: vec![pose; cameras],
        })
    }

    #[test]
    fn test_stereo_layout() {
        let root = tempfile::tempdir().unwrap();
        let mut stream = SaveStream::new(root.path());

        stream.handle(item(1, 100, 2));
        stream.handle(item(1, 200, 2));

        let dir = root.path().join("s1").join("001");
        assert!(dir.join("000").join("00000000.jpg").exists());
        assert!(dir.join("000").join("00000001.jpg").exists());
        assert!(dir.join("001").join("00000001.jpg").exists());

        let poses = fs::read_to_string(dir.join("pose_001.txt")).unwrap();
        let rows: Vec<&str> = poses.lines().collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], "1 0 0 1.5 0 1 0 0 0 0 1 0 0 0 0 1");

        let timestamps = fs::read_to_string(dir.join(TIMESTAMP_LOG_NAME)).unwrap();
        assert_eq!(timestamps, "100\n200\n");
    }

    #[test]
    fn test_new_run_reopens_files() {
        let root = tempfile::tempdir().unwrap();
        let mut stream = SaveStream::new(root.path());

        stream.handle(item(1, 100, 1));
        stream.handle(SaveCommand::Close {
            session: "s1".into(),
        });
        stream.handle(item(2, 300, 1));

        let second = root.path().join("s1").join("002");
        assert!(second.join("000").join("00000000.jpg").exists());
        assert!(!second.join("pose_001.txt").exists());
        let timestamps = fs::read_to_string(second.join(TIMESTAMP_LOG_NAME)).unwrap();
        assert_eq!(timestamps, "300\n");
    }

    #[test]
    fn test_grey16_is_saved_as_png() {
        let root = tempfile::tempdir().unwrap();
        let mut stream = SaveStream::new(root.path());
        let image: SharedImage = Arc::new(DynamicImage::ImageLuma16(ImageBuffer::from_pixel(
            2,
            2,
            Luma([1000u16]),
        )));

        stream.handle(SaveCommand::Frame(SaveItem {
            session: "s1".into(),
            run: 1,
            timestamp: Timestamp::from_millis(5),
            images: vec![image],
            poses: vec![Pose::identity()],
        }));

        let dir = root.path().join("s1").join("001").join("000");
        assert!(dir.join("00000000.png").exists());
    }

    #[test]
    fn test_unwritable_root_is_swallowed() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("file");
        fs::write(&blocker, b"x").unwrap();

        // the root is a regular file, so nothing can be created below it
        let mut stream = SaveStream::new(&blocker);
        stream.handle(item(1, 100, 1));
        assert!(stream.runs.is_empty());
    }
}
