mod painter;
mod result_view;

pub(crate) use self::painter::Painter;
pub(crate) use self::result_view::ResultView;
