use crate::geometry::BBox;

/// Class index of "person" in COCO-ordered detectors.
pub const PERSON_CLASS_ID: u32 = 0;

/// One detected object in a frame. Ephemeral: never persisted by the kernel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub score: f32,
    pub class_id: u32,
}

impl Detection {
    pub fn person(bbox: BBox, score: f32) -> Self {
        Self {
            bbox,
            score,
            class_id: PERSON_CLASS_ID,
        }
    }

    pub fn is_person(&self) -> bool {
        self.class_id == PERSON_CLASS_ID
    }
}

/// Person-class detections, in input order.
pub fn persons(detections: &[Detection]) -> impl Iterator<Item = &Detection> + '_ {
    detections.iter().filter(|d| d.is_person())
}
