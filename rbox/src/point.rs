use crate::common::*;

/// 2D point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point<T> {
    pub x: T,
    pub y: T,
}

impl<T> Point<T> {
    pub fn new(x: T, y: T) -> Self {
        Self { x, y }
    }

    pub fn try_cast<V>(self) -> Option<Point<V>>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        Some(Point {
            x: V::from(self.x)?,
            y: V::from(self.y)?,
        })
    }

    pub fn cast<V>(self) -> Point<V>
    where
        T: ToPrimitive,
        V: NumCast,
    {
        self.try_cast().unwrap()
    }
}

impl<T> Point<T>
where
    T: Float,
{
    /// Cross product of the vectors (self -> a) and (self -> b).
    pub fn cross(&self, a: &Self, b: &Self) -> T {
        (a.x - self.x) * (b.y - self.y) - (a.y - self.y) * (b.x - self.x)
    }
}
