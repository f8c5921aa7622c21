use image::{Rgb, RgbImage};

pub const TEST_IMAGE_WIDTH: u32 = 300;
pub const TEST_IMAGE_HEIGHT: u32 = 200;

const BLUE: Rgb<u8> = Rgb([0, 0, 255]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const GREEN: Rgb<u8> = Rgb([0, 255, 0]);

/// Synthetic 300x200 image: blue background, a red disc inside the box
/// (50, 50)-(150, 150) and a green 100x50 rectangle at (150, 75).
pub fn create_test_image() -> RgbImage {
    let mut image = RgbImage::from_pixel(TEST_IMAGE_WIDTH, TEST_IMAGE_HEIGHT, BLUE);

    fill_ellipse(&mut image, 50, 50, 100, 100, RED);
    fill_rect(&mut image, 150, 75, 100, 50, GREEN);

    image
}

fn fill_rect(image: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    let x_end = (x + width).min(image.width());
    let y_end = (y + height).min(image.height());
    for py in y..y_end {
        for px in x..x_end {
            image.put_pixel(px, py, color);
        }
    }
}

// Pixel centers inside the ellipse inscribed in the bounding box are filled.
fn fill_ellipse(image: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    let rx = width as f32 / 2.0;
    let ry = height as f32 / 2.0;
    let cx = x as f32 + rx;
    let cy = y as f32 + ry;

    let x_end = (x + width).min(image.width());
    let y_end = (y + height).min(image.height());
    for py in y..y_end {
        for px in x..x_end {
            let dx = (px as f32 + 0.5 - cx) / rx;
            let dy = (py as f32 + 0.5 - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                image.put_pixel(px, py, color);
            }
        }
    }
}
