//! Headless preview of dispatched frame sets
//!
//! Keeps the latest image of each camera of each session as a PNG so a
//! viewer can poll the directory.

use image::ImageFormat;
use log::{trace, warn};
use std::fs;
use std::path::PathBuf;

use crate::pipeline::types::SharedImage;
use crate::workers::sink::SinkHandler;

#[derive(Debug, Clone)]
pub struct DisplayItem {
    pub session: String,
    pub images: Vec<SharedImage>,
}

pub struct PreviewDisplay {
    dir: PathBuf,
    shown: u64,
}

impl PreviewDisplay {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            shown: 0,
        }
    }

    fn preview_path(&self, session: &str, camera: usize) -> PathBuf {
        self.dir.join(format!("{}_preview_{:03}.png", session, camera))
    }

    fn show(&mut self, item: &DisplayItem) -> Result<(), String> {
        fs::create_dir_all(&self.dir).map_err(|e| e.to_string())?;

        for (camera, image) in item.images.iter().enumerate() {
            let target = self.preview_path(&item.session, camera);
            // write beside the target and swap so readers never see a partial file
            let staging = target.with_extension("tmp");
            image
                .save_with_format(&staging, ImageFormat::Png)
                .map_err(|e| e.to_string())?;
            fs::rename(&staging, &target).map_err(|e| e.to_string())?;
        }

        self.shown += 1;
        Ok(())
    }
}

impl SinkHandler<DisplayItem> for PreviewDisplay {
    fn handle(&mut self, item: DisplayItem) {
        match self.show(&item) {
            Ok(()) => trace!("Display: {} frame {} shown", item.session, self.shown),
            Err(e) => warn!("Display: {} frame not shown: {}", item.session, e),
        }
    }
}
