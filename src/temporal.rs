use nalgebra::{Matrix4, Point3};

/// Camera state for one frame, as handed over by the camera collaborator.
#[derive(Clone, Copy, Debug)]
pub struct CameraFrame {
    pub view: Matrix4<f32>,
    pub proj: Matrix4<f32>,
    pub position: Point3<f32>,
}

impl Default for CameraFrame {
    fn default() -> Self {
        Self {
            view: Matrix4::identity(),
            proj: Matrix4::identity(),
            position: Point3::origin(),
        }
    }
}

/// History carried between frames for reprojection and motion-dependent effects.
///
/// Anything here describes the previous frame's images, so it is meaningless once those images
/// are destroyed; [`TemporalState::reset`] runs on every swapchain recreation.
#[derive(Clone, Copy, Debug)]
pub struct TemporalState {
    pub has_prev_view_proj: bool,
    pub prev_view: Matrix4<f32>,
    pub prev_proj: Matrix4<f32>,
    pub prev_view_proj: Matrix4<f32>,
    pub prev_camera_pos: Point3<f32>,
    pub camera_pos: Point3<f32>,
    pub frame_counter: u64,
}

impl Default for TemporalState {
    fn default() -> Self {
        Self {
            has_prev_view_proj: false,
            prev_view: Matrix4::identity(),
            prev_proj: Matrix4::identity(),
            prev_view_proj: Matrix4::identity(),
            prev_camera_pos: Point3::origin(),
            camera_pos: Point3::origin(),
            frame_counter: 0,
        }
    }
}

impl TemporalState {
    /// Records `camera` as the frame just rendered.
    pub fn advance(&mut self, camera: &CameraFrame) {
        self.prev_view = camera.view;
        self.prev_proj = camera.proj;
        self.prev_view_proj = camera.proj * camera.view;
        self.prev_camera_pos = self.camera_pos;
        self.camera_pos = camera.position;
        self.has_prev_view_proj = true;
        self.frame_counter += 1;
    }

    /// Drops history: identity matrices, previous position snapped to current, counter zeroed.
    pub fn reset(&mut self) {
        self.has_prev_view_proj = false;
        self.prev_view = Matrix4::identity();
        self.prev_proj = Matrix4::identity();
        self.prev_view_proj = Matrix4::identity();
        self.prev_camera_pos = self.camera_pos;
        self.frame_counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn advance_then_reset() {
        let camera = CameraFrame {
            view: Matrix4::new_translation(&Vector3::new(0.0, 0.0, -5.0)),
            proj: Matrix4::new_scaling(2.0),
            position: Point3::new(1.0, 2.0, 3.0),
        };
        let mut temporal = TemporalState::default();
        temporal.advance(&camera);
        temporal.advance(&camera);
        assert!(temporal.has_prev_view_proj);
        assert_eq!(temporal.frame_counter, 2);
        assert_eq!(temporal.prev_view_proj, camera.proj * camera.view);

        temporal.reset();
        assert!(!temporal.has_prev_view_proj);
        assert_eq!(temporal.frame_counter, 0);
        assert_eq!(temporal.prev_view_proj, Matrix4::identity());
        assert_eq!(temporal.prev_camera_pos, Point3::new(1.0, 2.0, 3.0));
    }
}
