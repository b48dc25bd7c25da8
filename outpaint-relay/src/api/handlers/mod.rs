pub mod outpaint;
pub mod static_assets;
